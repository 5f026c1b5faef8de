//! Interactive driver for the lookup engines: loads an optional route
//! configuration, then serves the textual command channel on stdin.

use std::env;
use std::error::Error;
use std::fs;
use std::net::IpAddr;
use std::process;

use ansi_term::Colour;
use rustyline::error::ReadlineError;
use rustyline::Editor;

use fib_store::types::route::RouteSpec;
use fib_store::{
    DirectLookup, DxrLookup, ManualScheduler, Route, RouteStoreError,
    RouteTable,
};

enum V4Engine {
    Dir(DirectLookup),
    Dxr(DxrLookup),
}

impl V4Engine {
    fn add_route(
        &mut self,
        route: &Route<u32>,
        set: bool,
    ) -> Result<Option<Route<u32>>, RouteStoreError> {
        match self {
            V4Engine::Dir(e) => e.add_route(route, set),
            V4Engine::Dxr(e) => e.add_route(route, set),
        }
    }

    fn remove_route(
        &mut self,
        addr: u32,
        masklen: u8,
    ) -> Result<Route<u32>, RouteStoreError> {
        match self {
            V4Engine::Dir(e) => e.remove_route(addr, masklen),
            V4Engine::Dxr(e) => e.remove_route(addr, masklen),
        }
    }

    fn lookup_route(&self, addr: u32) -> (i32, u32) {
        match self {
            V4Engine::Dir(e) => e.lookup_route(addr),
            V4Engine::Dxr(e) => e.lookup_route(addr),
        }
    }

    fn apply_pending(&mut self) {
        match self {
            V4Engine::Dir(e) => e.apply_pending(),
            V4Engine::Dxr(e) => e.apply_pending(),
        }
    }

    fn flush(&mut self) {
        match self {
            V4Engine::Dir(e) => e.flush(),
            V4Engine::Dxr(e) => e.flush(),
        }
    }

    fn dump_routes(&self) -> String {
        match self {
            V4Engine::Dir(e) => e.dump_routes(),
            V4Engine::Dxr(e) => e.dump_routes(),
        }
    }

    fn status_text(&self) -> String {
        match self {
            V4Engine::Dir(e) => e.status().to_string(),
            V4Engine::Dxr(e) => e.status().to_string(),
        }
    }
}

struct Cli {
    v4: V4Engine,
    v6: RouteTable<u128>,
}

impl Cli {
    fn apply_spec(
        &mut self,
        spec: &RouteSpec,
        set: bool,
    ) -> Result<(), RouteStoreError> {
        match spec {
            RouteSpec::V4(r) => self.v4.add_route(r, set).map(|_| ()),
            RouteSpec::V6(r) => self.v6.add_route(r, set).map(|_| ()),
        }
    }

    fn remove_spec(&mut self, arg: &str) -> Result<(), RouteStoreError> {
        // `remove` takes just the prefix; reuse the route parser with a
        // dummy port.
        let spec: RouteSpec = format!("{} 0", arg.trim())
            .parse()
            .map_err(|_| RouteStoreError::InvalidRoute)?;
        match spec {
            RouteSpec::V4(r) => {
                self.v4.remove_route(r.addr, r.masklen).map(|_| ())
            }
            RouteSpec::V6(r) => {
                self.v6.remove_route(r.addr, r.masklen).map(|_| ())
            }
        }
    }

    fn lookup(&self, arg: &str) -> Result<String, RouteStoreError> {
        let addr: IpAddr = arg
            .trim()
            .parse()
            .map_err(|_| RouteStoreError::InvalidRoute)?;
        let (port, gw) = match addr {
            IpAddr::V4(a) => {
                let (port, gw) = self.v4.lookup_route(a.into());
                (port, IpAddr::V4(gw.into()))
            }
            IpAddr::V6(a) => {
                let (port, gw) = self.v6.lookup_route(a.into());
                (port, IpAddr::V6(gw.into()))
            }
        };
        if match addr {
            IpAddr::V4(_) => gw == IpAddr::V4(0u32.into()),
            IpAddr::V6(_) => gw == IpAddr::V6(0u128.into()),
        } {
            Ok(format!("{}", port))
        } else {
            Ok(format!("{} {}", port, gw))
        }
    }

    /// Run a batch of `add`/`set`/`remove` lines, then apply the
    /// accumulated chunk updates in one pass.
    fn ctrl(&mut self, lines: &[String]) -> Result<(), String> {
        for (no, line) in lines.iter().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (cmd, rest) = match line.split_once(char::is_whitespace) {
                Some((c, r)) => (c, r),
                None => (line, ""),
            };
            let res = match cmd {
                "add" => rest
                    .parse::<RouteSpec>()
                    .and_then(|s| self.apply_spec(&s, false)),
                "set" => rest
                    .parse::<RouteSpec>()
                    .and_then(|s| self.apply_spec(&s, true)),
                "remove" => self.remove_spec(rest),
                _ => Err(RouteStoreError::InvalidRoute),
            };
            if let Err(e) = res {
                return Err(format!("line {}: {}", no + 1, e));
            }
        }
        self.v4.apply_pending();
        Ok(())
    }
}

fn load_config(cli: &mut Cli, path: &str) -> Result<(), Box<dyn Error>> {
    let text = fs::read_to_string(path)?;
    for (no, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let spec: RouteSpec = line.parse().map_err(|e| {
            format!("{}:{}: {}", path, no + 1, e)
        })?;
        cli.apply_spec(&spec, false)
            .map_err(|e| format!("{}:{}: {}", path, no + 1, e))?;
    }
    cli.v4.apply_pending();
    Ok(())
}

const HELP: &str = "\
commands:
  add ADDR/MASK [GW] OUT     add a route, fails if present
  set ADDR/MASK [GW] OUT     add or replace a route
  remove ADDR/MASK           remove a route, fails if absent
  ctrl                       batch add/set/remove lines, end with `.`
  flush                      remove all routes
  table                      dump the routing table
  lookup ADDR                longest-prefix-match an address
  stat | status              engine state report
  quit";

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let mut args = env::args().skip(1);
    let mut engine_name = String::from("dxr");
    let mut config = None;
    if let Some(arg) = args.next() {
        if arg == "dir" || arg == "dxr" {
            engine_name = arg;
            config = args.next();
        } else {
            config = Some(arg);
        }
    }

    let v4 = match engine_name.as_str() {
        "dir" => {
            let mut e = DirectLookup::new();
            e.initialize(Box::new(ManualScheduler::new()));
            V4Engine::Dir(e)
        }
        _ => {
            let mut e = DxrLookup::new();
            e.initialize(Box::new(ManualScheduler::new()));
            V4Engine::Dxr(e)
        }
    };
    let mut cli = Cli {
        v4,
        v6: RouteTable::new(),
    };

    if let Some(path) = &config {
        if let Err(err) = load_config(&mut cli, path) {
            eprintln!("{}", Colour::Red.paint(err.to_string()));
            process::exit(1);
        }
        println!(
            "loaded {} ipv4 + {} ipv6 prefixes from {}",
            match &cli.v4 {
                V4Engine::Dir(e) => e.prefix_count(),
                V4Engine::Dxr(e) => e.prefix_count(),
            },
            cli.v6.prefix_count(),
            path
        );
    }

    let mut rl = Editor::<()>::new()?;
    loop {
        let line = match rl.readline(&format!("({})> ", engine_name)) {
            Ok(line) => line,
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => {
                break;
            }
            Err(err) => return Err(err.into()),
        };
        rl.add_history_entry(line.as_str());
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (cmd, rest) = match line.split_once(char::is_whitespace) {
            Some((c, r)) => (c, r.trim()),
            None => (line, ""),
        };

        let result: Result<Option<String>, String> = match cmd {
            "add" | "set" => rest
                .parse::<RouteSpec>()
                .and_then(|s| cli.apply_spec(&s, cmd == "set"))
                .map(|_| {
                    cli.v4.apply_pending();
                    None
                })
                .map_err(|e| e.to_string()),
            "remove" => cli
                .remove_spec(rest)
                .map(|_| {
                    cli.v4.apply_pending();
                    None
                })
                .map_err(|e| e.to_string()),
            "ctrl" => {
                let mut batch = Vec::new();
                loop {
                    match rl.readline("(ctrl)> ") {
                        Ok(l) => {
                            if l.trim() == "." {
                                break;
                            }
                            batch.push(l);
                        }
                        Err(_) => break,
                    }
                }
                cli.ctrl(&batch).map(|_| None)
            }
            "flush" => {
                cli.v4.flush();
                cli.v6.flush();
                Ok(None)
            }
            "table" => {
                let mut out = cli.v4.dump_routes();
                out.push_str(&cli.v6.dump_routes());
                Ok(Some(out))
            }
            "lookup" => cli.lookup(rest).map(Some).map_err(|e| e.to_string()),
            "stat" | "status" => {
                let mut out = cli.v4.status_text();
                out.push_str(&format!("IPv6: {}", cli.v6.status()));
                Ok(Some(out))
            }
            "help" => Ok(Some(HELP.into())),
            "quit" | "exit" => break,
            _ => Err(format!("unknown command `{}`, try `help`", cmd)),
        };

        match result {
            Ok(Some(text)) => print!("{}", ensure_newline(text)),
            Ok(None) => {}
            Err(e) => eprintln!("{}", Colour::Red.paint(e)),
        }
    }
    Ok(())
}

fn ensure_newline(mut s: String) -> String {
    if !s.ends_with('\n') {
        s.push('\n');
    }
    s
}
