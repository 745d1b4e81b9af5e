//! Command filters
//!
//! A command carries a filter list. A guest acts on the command only
//! when its state matches at least one entry; within an entry every
//! populated attribute must match. IP attributes accept an exact
//! address or IPv4 CIDR notation. Malformed CIDRs are rejected when the
//! command is submitted, not silently never matched.

use std::net::Ipv4Addr;

use minimega_codec::minicbor::{decode, encode, Decode, Decoder, Encode, Encoder};

use crate::wire::ClientState;
use crate::Error;

/// One filter entry; empty attributes are wildcards
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub uuid: String,
    pub hostname: String,
    pub arch: String,
    pub os: String,
    /// Exact address or IPv4 CIDR (`10.0.0.0/24`)
    pub ip: String,
    pub mac: String,
}

impl Filter {
    pub fn is_empty(&self) -> bool {
        self.uuid.is_empty()
            && self.hostname.is_empty()
            && self.arch.is_empty()
            && self.os.is_empty()
            && self.ip.is_empty()
            && self.mac.is_empty()
    }

    fn matches(&self, state: &ClientState) -> bool {
        if !self.uuid.is_empty() && self.uuid != state.uuid {
            return false;
        }
        if !self.hostname.is_empty() && self.hostname != state.hostname {
            return false;
        }
        if !self.arch.is_empty() && self.arch != state.arch {
            return false;
        }
        if !self.os.is_empty() && self.os != state.os {
            return false;
        }
        if !self.mac.is_empty() && !state.macs.iter().any(|m| m.eq_ignore_ascii_case(&self.mac)) {
            return false;
        }
        if !self.ip.is_empty() {
            let hit = state.ips.iter().any(|ip| ip_matches(&self.ip, ip));
            if !hit {
                return false;
            }
        }

        true
    }
}

/// True when the state matches at least one entry; an empty list
/// matches everyone
pub fn matches(filters: &[Filter], state: &ClientState) -> bool {
    if filters.is_empty() {
        return true;
    }

    filters.iter().any(|f| f.matches(state))
}

/// Validate a filter list at submission time; the only rejectable
/// attribute is a malformed CIDR
pub fn validate(filters: &[Filter]) -> Result<(), Error> {
    for f in filters {
        if f.ip.contains('/') && parse_cidr(&f.ip).is_none() {
            return Err(Error::BadFilter(f.ip.clone()));
        }
    }

    Ok(())
}

fn ip_matches(pattern: &str, ip: &str) -> bool {
    if !pattern.contains('/') {
        return pattern == ip;
    }

    let Some((net, bits)) = parse_cidr(pattern) else {
        return false;
    };
    let Ok(addr) = ip.parse::<Ipv4Addr>() else {
        return false;
    };

    let mask = if bits == 0 {
        0
    } else {
        u32::MAX << (32 - bits)
    };

    (u32::from(addr) & mask) == (u32::from(net) & mask)
}

fn parse_cidr(s: &str) -> Option<(Ipv4Addr, u8)> {
    let (addr, bits) = s.split_once('/')?;
    let addr = addr.parse::<Ipv4Addr>().ok()?;
    let bits = bits.parse::<u8>().ok()?;
    if bits > 32 {
        return None;
    }

    Some((addr, bits))
}

impl Encode<()> for Filter {
    fn encode<W: encode::Write>(
        &self,
        e: &mut Encoder<W>,
        _ctx: &mut (),
    ) -> Result<(), encode::Error<W::Error>> {
        e.array(6)?;
        e.str(&self.uuid)?;
        e.str(&self.hostname)?;
        e.str(&self.arch)?;
        e.str(&self.os)?;
        e.str(&self.ip)?;
        e.str(&self.mac)?;

        Ok(())
    }
}

impl<'b> Decode<'b, ()> for Filter {
    fn decode(d: &mut Decoder<'b>, _ctx: &mut ()) -> Result<Self, decode::Error> {
        d.array()?;

        Ok(Filter {
            uuid: d.str()?.to_string(),
            hostname: d.str()?.to_string(),
            arch: d.str()?.to_string(),
            os: d.str()?.to_string(),
            ip: d.str()?.to_string(),
            mac: d.str()?.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn guest() -> ClientState {
        ClientState {
            uuid: "u-1".into(),
            hostname: "web0".into(),
            arch: "x86_64".into(),
            os: "linux".into(),
            ips: vec!["10.0.1.7".into(), "192.168.0.3".into()],
            macs: vec!["52:54:00:AA:BB:CC".into()],
            ..Default::default()
        }
    }

    #[test]
    fn empty_filter_list_matches_everyone() {
        assert!(matches(&[], &guest()));
    }

    #[test]
    fn attributes_and_within_an_entry() {
        let f = Filter {
            hostname: "web0".into(),
            os: "linux".into(),
            ..Default::default()
        };
        assert!(matches(&[f], &guest()));

        let f = Filter {
            hostname: "web0".into(),
            os: "plan9".into(),
            ..Default::default()
        };
        assert!(!matches(&[f], &guest()));
    }

    #[test]
    fn entries_or_across_the_list() {
        let miss = Filter {
            hostname: "db0".into(),
            ..Default::default()
        };
        let hit = Filter {
            uuid: "u-1".into(),
            ..Default::default()
        };

        assert!(matches(&[miss.clone(), hit], &guest()));
        assert!(!matches(&[miss], &guest()));
    }

    #[test]
    fn cidr_matches_subnets() {
        let f = Filter {
            ip: "10.0.1.0/24".into(),
            ..Default::default()
        };
        assert!(matches(&[f], &guest()));

        let f = Filter {
            ip: "10.0.2.0/24".into(),
            ..Default::default()
        };
        assert!(!matches(&[f], &guest()));

        let f = Filter {
            ip: "192.168.0.3".into(),
            ..Default::default()
        };
        assert!(matches(&[f], &guest()));
    }

    #[test]
    fn mac_matching_ignores_case() {
        let f = Filter {
            mac: "52:54:00:aa:bb:cc".into(),
            ..Default::default()
        };
        assert!(matches(&[f], &guest()));
    }

    #[test]
    fn malformed_cidr_is_rejected_at_validation() {
        let bad = Filter {
            ip: "10.0.0.0/40".into(),
            ..Default::default()
        };
        assert!(validate(&[bad]).is_err());

        let bad = Filter {
            ip: "not-an-ip/8".into(),
            ..Default::default()
        };
        assert!(validate(&[bad]).is_err());

        let good = Filter {
            ip: "10.0.0.0/8".into(),
            ..Default::default()
        };
        assert!(validate(&[good]).is_ok());
    }
}
