use criterion::{
    criterion_group, criterion_main, BenchmarkId, Criterion, Throughput,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use fib_store::{DirectLookup, DxrLookup, Route, RouteTable};

const ROUTES: usize = 100_000;
const KEYS: usize = 64 * 1024;

fn synth_routes(rng: &mut StdRng) -> Vec<Route<u32>> {
    let mut routes = Vec::with_capacity(ROUTES);
    // A default route plus a mix of /16../24 with an occasional longer
    // prefix, roughly the shape of a DFZ view.
    routes.push(Route::new(0, 0, 0, 0));
    for i in 0..ROUTES - 1 {
        let len = match rng.gen_range(0..100) {
            0..=4 => rng.gen_range(8..16),
            5..=79 => rng.gen_range(16..=24),
            _ => rng.gen_range(25..=32),
        };
        let addr = rng.gen::<u32>();
        routes.push(Route::new(addr, len, 0, (i % 4000) as i32));
    }
    routes
}

fn rnd_keys(rng: &mut StdRng) -> Vec<u32> {
    (0..KEYS).map(|_| rng.gen()).collect()
}

fn bench_lookups(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(20120905);
    let routes = synth_routes(&mut rng);
    let keys = rnd_keys(&mut rng);

    let mut radix = RouteTable::new();
    let mut dir = DirectLookup::new();
    let mut dxr = DxrLookup::new();
    for r in &routes {
        radix.add_route(r, true).unwrap();
        dir.add_route(r, true).unwrap();
        dxr.add_route(r, true).unwrap();
    }
    dir.apply_pending();
    dxr.apply_pending();

    let mut group = c.benchmark_group("lookup");
    group.throughput(Throughput::Elements(KEYS as u64));

    // Uniformly random keys.
    group.bench_with_input(BenchmarkId::new("rnd", "radix"), &keys, |b, keys| {
        b.iter(|| {
            keys.iter()
                .map(|&k| radix.lookup_route(k).0 as i64)
                .sum::<i64>()
        })
    });
    group.bench_with_input(BenchmarkId::new("rnd", "dir"), &keys, |b, keys| {
        b.iter(|| {
            keys.iter()
                .map(|&k| dir.lookup_route(k).0 as i64)
                .sum::<i64>()
        })
    });
    group.bench_with_input(BenchmarkId::new("rnd", "dxr"), &keys, |b, keys| {
        b.iter(|| {
            keys.iter()
                .map(|&k| dxr.lookup_route(k).0 as i64)
                .sum::<i64>()
        })
    });

    // Each lookup's key depends on the previous result, serializing the
    // memory accesses.
    group.bench_with_input(BenchmarkId::new("seq", "dir"), &keys, |b, keys| {
        b.iter(|| {
            let mut port = 0i32;
            for &k in keys {
                port = dir.lookup_route(k.wrapping_add(port as u32)).0;
            }
            port
        })
    });
    group.bench_with_input(BenchmarkId::new("seq", "dxr"), &keys, |b, keys| {
        b.iter(|| {
            let mut port = 0i32;
            for &k in keys {
                port = dxr.lookup_route(k.wrapping_add(port as u32)).0;
            }
            port
        })
    });

    // The same key over and over: everything stays cache-hot.
    group.bench_function("rep/dxr", |b| {
        let k = keys[0];
        b.iter(|| dxr.lookup_route(k).0)
    });
    group.finish();
}

fn bench_updates(c: &mut Criterion) {
    let mut rng = StdRng::seed_from_u64(20120905);
    let routes = synth_routes(&mut rng);

    c.bench_function("update/dxr-build", |b| {
        b.iter(|| {
            let mut dxr = DxrLookup::new();
            for r in &routes[..10_000] {
                dxr.add_route(r, true).unwrap();
            }
            dxr.apply_pending();
            dxr.prefix_count()
        })
    });
}

criterion_group!(benches, bench_lookups, bench_updates);
criterion_main!(benches);
