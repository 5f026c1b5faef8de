use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use inetnum::addr::Prefix;

use super::af::AddressFamily;
use super::errors::RouteStoreError;

//------------ Route ---------------------------------------------------------

/// A single route entry: a destination prefix, a gateway and an output
/// port. An all-zeros gateway means "no gateway".
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Route<AF: AddressFamily> {
    /// The prefix address. Bits beyond `masklen` are always zero.
    pub addr: AF,
    /// The prefix length.
    pub masklen: u8,
    /// The next-hop gateway, `AF::ZERO` if none.
    pub gw: AF,
    /// The output port. Negative means discard.
    pub port: i32,
}

impl<AF: AddressFamily> Route<AF> {
    pub fn new(addr: AF, masklen: u8, gw: AF, port: i32) -> Self {
        Route {
            addr: addr.truncate_to_len(masklen),
            masklen,
            gw,
            port,
        }
    }

    /// The lowest and highest addresses covered by this route's prefix.
    pub fn range(&self) -> (AF, AF) {
        (self.addr, self.addr.range_end(self.masklen))
    }
}

impl<AF: AddressFamily> fmt::Display for Route<AF> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}/{}\t{}\t{}",
            self.addr.into_ipaddr(),
            self.masklen,
            self.gw.into_ipaddr(),
            self.port
        )
    }
}

//------------ RouteSpec -----------------------------------------------------

/// A parsed `ADDR/MASK [GW] OUT` route specification of either family.
///
/// This is the textual route format used both by the configuration input
/// and by the `add`/`set` commands.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RouteSpec {
    V4(Route<u32>),
    V6(Route<u128>),
}

impl FromStr for RouteSpec {
    type Err = RouteStoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let words: Vec<&str> = s.split_whitespace().collect();
        if words.len() < 2 || words.len() > 3 {
            return Err(RouteStoreError::InvalidRoute);
        }

        let prefix = Prefix::from_str(words[0])
            .map_err(|_| RouteStoreError::InvalidRoute)?;
        let port = words[words.len() - 1]
            .parse::<i32>()
            .map_err(|_| RouteStoreError::InvalidRoute)?;
        if port < 0 {
            return Err(RouteStoreError::InvalidRoute);
        }
        let gw = if words.len() == 3 {
            Some(
                words[1]
                    .parse::<IpAddr>()
                    .map_err(|_| RouteStoreError::InvalidRoute)?,
            )
        } else {
            None
        };

        match prefix.addr() {
            IpAddr::V4(a) => {
                let gw = match gw {
                    None => 0,
                    Some(IpAddr::V4(g)) => g.into(),
                    Some(IpAddr::V6(_)) => {
                        return Err(RouteStoreError::InvalidRoute)
                    }
                };
                Ok(RouteSpec::V4(Route::new(
                    a.into(),
                    prefix.len(),
                    gw,
                    port,
                )))
            }
            IpAddr::V6(a) => {
                let gw = match gw {
                    None => 0,
                    Some(IpAddr::V6(g)) => g.into(),
                    Some(IpAddr::V4(_)) => {
                        return Err(RouteStoreError::InvalidRoute)
                    }
                };
                Ok(RouteSpec::V6(Route::new(
                    a.into(),
                    prefix.len(),
                    gw,
                    port,
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_v4_specs() {
        let spec: RouteSpec = "10.0.0.0/8 1".parse().unwrap();
        assert_eq!(
            spec,
            RouteSpec::V4(Route::new(0x0a000000, 8, 0, 1))
        );

        let spec: RouteSpec = "0.0.0.0/0 192.0.2.1 0".parse().unwrap();
        assert_eq!(
            spec,
            RouteSpec::V4(Route::new(0, 0, 0xc0000201, 0))
        );
    }

    #[test]
    fn parse_v6_specs() {
        let spec: RouteSpec = "2001:db8::/32 4".parse().unwrap();
        match spec {
            RouteSpec::V6(r) => {
                assert_eq!(r.masklen, 32);
                assert_eq!(r.port, 4);
                assert_eq!(r.gw, 0);
            }
            _ => panic!("wrong family"),
        }
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!("10.0.0.0/8".parse::<RouteSpec>().is_err());
        assert!("10.0.0.0/8 x".parse::<RouteSpec>().is_err());
        assert!("10.0.0.0/8 -1".parse::<RouteSpec>().is_err());
        assert!("10.0.0.0/33 1".parse::<RouteSpec>().is_err());
        assert!("10.0.0.0/8 2001:db8::1 1".parse::<RouteSpec>().is_err());
        assert!("".parse::<RouteSpec>().is_err());
    }

    #[test]
    fn display_dump_format() {
        let r: Route<u32> = Route::new(0x0a000000, 8, 0, 1);
        assert_eq!(r.to_string(), "10.0.0.0/8\t0.0.0.0\t1");
    }
}
