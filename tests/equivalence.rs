use proptest::collection::vec;
use proptest::prelude::*;

use fib_store::{DirectLookup, DxrLookup, Route, RouteTable};

mod common {
    use std::io::Write;

    pub fn init() {
        let _ = env_logger::builder()
            .format(|buf, record| writeln!(buf, "{}", record.args()))
            .is_test(true)
            .try_init();
    }
}

prop_compose! {
    // Prefixes shorter than /6 span tens of thousands of accelerator
    // chunks apiece; they behave like /6 in every chunk they cover and
    // would only slow the exploration down. The default route is kept
    // in the mix.
    fn arb_route()(
        addr in any::<u32>(),
        len in prop_oneof![1 => Just(0u8), 15 => 6u8..=32],
        port in 0i32..50,
    ) -> Route<u32> {
        Route::new(addr, len, 0, port)
    }
}

proptest! {
    // The big tables make each case allocation-heavy, keep the count
    // moderate.
    #![proptest_config(ProptestConfig::with_cases(32))]

    /// After all pending updates are applied, the three engines answer
    /// every probe identically.
    #[test]
    fn lpm_equivalence(
        routes in vec(arb_route(), 0..48),
        probes in vec(any::<u32>(), 64),
    ) {
        common::init();
        let mut radix = RouteTable::new();
        let mut dir = DirectLookup::new();
        let mut dxr = DxrLookup::new();
        for r in &routes {
            // Duplicate prefixes may occur in the input: `set` keeps
            // the engines in agreement on the survivor.
            radix.add_route(r, true).unwrap();
            dir.add_route(r, true).unwrap();
            dxr.add_route(r, true).unwrap();
        }
        dir.apply_pending();
        dxr.apply_pending();

        // Probe the prefix edges and their outsides as well as the
        // random addresses.
        let mut all_probes = probes;
        for r in &routes {
            let (start, end) = r.range();
            all_probes.push(start);
            all_probes.push(end);
            all_probes.push(start.wrapping_sub(1));
            all_probes.push(end.wrapping_add(1));
        }
        for addr in all_probes {
            let want = radix.lookup_route(addr);
            prop_assert_eq!(dir.lookup_route(addr), want,
                "dir disagrees at {:#010x}", addr);
            prop_assert_eq!(dxr.lookup_route(addr), want,
                "dxr disagrees at {:#010x}", addr);
        }
    }
}

proptest! {
    #[test]
    fn add_remove_round_trip(
        base in vec(arb_route(), 0..24),
        extra in arb_route(),
        probes in vec(any::<u32>(), 32),
    ) {
        common::init();
        let mut tbl = RouteTable::new();
        for r in &base {
            let _ = tbl.add_route(r, false);
        }
        let before_dump = tbl.dump_routes();
        let before: Vec<_> =
            probes.iter().map(|&a| tbl.lookup_route(a)).collect();

        // Only a genuinely new prefix makes a round trip.
        if tbl.add_route(&extra, false).is_ok() {
            tbl.remove_route(extra.addr, extra.masklen).unwrap();
        }

        prop_assert_eq!(tbl.dump_routes(), before_dump);
        let after: Vec<_> =
            probes.iter().map(|&a| tbl.lookup_route(a)).collect();
        prop_assert_eq!(after, before);
    }

    #[test]
    fn set_is_idempotent(
        base in vec(arb_route(), 0..24),
        extra in arb_route(),
    ) {
        common::init();
        let mut once = RouteTable::new();
        let mut twice = RouteTable::new();
        for r in &base {
            let _ = once.add_route(r, true);
            let _ = twice.add_route(r, true);
        }
        once.add_route(&extra, true).unwrap();
        twice.add_route(&extra, true).unwrap();
        twice.add_route(&extra, true).unwrap();

        prop_assert_eq!(once.dump_routes(), twice.dump_routes());
        prop_assert_eq!(once.prefix_count(), twice.prefix_count());
        prop_assert_eq!(once.nexthop_count(), twice.nexthop_count());
    }

    #[test]
    fn double_flush_is_single_flush(
        routes in vec(arb_route(), 0..24),
        probes in vec(any::<u32>(), 16),
    ) {
        common::init();
        let mut tbl = RouteTable::new();
        for r in &routes {
            let _ = tbl.add_route(r, true);
        }
        tbl.flush();
        let dump = tbl.dump_routes();
        tbl.flush();
        prop_assert_eq!(tbl.dump_routes(), dump);
        prop_assert_eq!(tbl.prefix_count(), 0);
        prop_assert_eq!(tbl.nexthop_count(), 0);
        for a in probes {
            prop_assert_eq!(tbl.lookup_route(a).0, -1);
        }
    }
}
