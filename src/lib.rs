//! IP longest-prefix-match lookup engines for a software forwarding
//! element.
//!
//! The authoritative store is a radix tree of prefixes over an interned
//! nexthop table, wrapped by [`RouteTable`]. Two co-designed IPv4 fast
//! paths expand that tree into flat lookup structures: [`DirectLookup`]
//! implements the DIR-24-8-BASIC scheme of Gupta, Lin and McKeown
//! (direct-indexed tables, one to two memory accesses per lookup), and
//! [`DxrLookup`] implements Zec, Rizzo and Mikuc's DXR (binary search in
//! compact deduplicated range chunks). Both reconverge after update
//! batches by re-expanding only the chunks a route change touched.
//!
//! IPv6 is served by the radix backend alone, as `RouteTable<u128>`.

pub mod dir24_8;
pub mod dxr;
pub mod nexthop;
pub mod pending;
pub mod radix;
pub mod table;
pub mod types;

mod chunk;

pub use crate::dir24_8::DirectLookup;
pub use crate::dxr::DxrLookup;
pub use crate::pending::{ManualScheduler, UpdateScheduler, UPDATE_HOLDDOWN};
pub use crate::table::RouteTable;
pub use crate::types::errors::RouteStoreError;
pub use crate::types::{AddressFamily, Route, RouteSpec};
