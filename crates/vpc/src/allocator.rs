//! Address-space allocation.
//!
//! Carves child blocks out of a parent block. Selection among the free
//! candidates is uniformly random; the occupied set is always recomputed by
//! the caller from live resources, so nothing here keeps state.

use std::fmt;
use std::str::FromStr;

use ipnet::Ipv4Net;
use rand::seq::SliceRandom;
use rand::Rng;

use crate::error::{Result, VpcError};

/// Longest IPv4 prefix.
pub const MAX_PREFIX_LEN: u8 = 32;

/// Configured value of a `*_cidr` key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CidrSetting {
    /// Pick a free block.
    Auto,
    /// Use this block, trusted without collision checks.
    Explicit(Ipv4Net),
}

impl FromStr for CidrSetting {
    type Err = VpcError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        s.parse()
            .map(Self::Explicit)
            .map_err(|_| VpcError::Config(format!("'{s}' is neither 'auto' nor a CIDR block")))
    }
}

impl fmt::Display for CidrSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Explicit(net) => write!(f, "{net}"),
        }
    }
}

/// A chosen block and the occupied blocks it was checked against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressAllocation {
    pub block: Ipv4Net,
    pub occupied: Vec<Ipv4Net>,
}

/// Extra network bits needed to split a block into `child_count` equal children.
#[must_use]
pub fn child_prefix_offset(child_count: usize) -> u8 {
    if child_count <= 1 {
        return 0;
    }
    let bits = usize::BITS - (child_count - 1).leading_zeros();
    u8::try_from(bits).unwrap_or(u8::MAX)
}

/// Prefix length of each of `child_count` equal children of `parent`.
///
/// # Errors
/// `Config` if the children would be smaller than a single address.
pub fn child_prefix_len(parent: Ipv4Net, child_count: usize) -> Result<u8> {
    let prefix_len = parent
        .prefix_len()
        .saturating_add(child_prefix_offset(child_count));
    if prefix_len > MAX_PREFIX_LEN {
        return Err(VpcError::Config(format!(
            "{parent} cannot be split into {child_count} blocks"
        )));
    }
    Ok(prefix_len)
}

fn overlaps(a: &Ipv4Net, b: &Ipv4Net) -> bool {
    a.contains(&b.network()) || b.contains(&a.network())
}

/// Every `/prefix_len` block of `parent` that intersects none of `occupied`.
#[must_use]
pub fn free_subnets(parent: Ipv4Net, prefix_len: u8, occupied: &[Ipv4Net]) -> Vec<Ipv4Net> {
    match parent.subnets(prefix_len) {
        Ok(candidates) => candidates
            .filter(|candidate| !occupied.iter().any(|o| overlaps(candidate, o)))
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Pick a random free `/prefix_len` block of `parent`.
#[must_use]
pub fn pick_free_subnet(parent: Ipv4Net, prefix_len: u8, occupied: &[Ipv4Net]) -> Option<Ipv4Net> {
    pick_free_subnet_with(&mut rand::thread_rng(), parent, prefix_len, occupied)
}

/// [`pick_free_subnet`] with a caller-supplied source of randomness.
pub fn pick_free_subnet_with<R: Rng + ?Sized>(
    rng: &mut R,
    parent: Ipv4Net,
    prefix_len: u8,
    occupied: &[Ipv4Net],
) -> Option<Ipv4Net> {
    free_subnets(parent, prefix_len, occupied)
        .choose(rng)
        .copied()
}

/// Allocate one block for `requester`.
///
/// # Errors
/// `AddressSpaceExhausted` if every candidate is taken.
pub fn allocate(
    requester: &str,
    parent: Ipv4Net,
    prefix_len: u8,
    occupied: Vec<Ipv4Net>,
) -> Result<AddressAllocation> {
    match pick_free_subnet(parent, prefix_len, &occupied) {
        Some(block) => Ok(AddressAllocation { block, occupied }),
        None => Err(VpcError::AddressSpaceExhausted {
            requester: requester.to_string(),
            parent: parent.to_string(),
            prefix_len,
        }),
    }
}

/// Resolve a full set of sibling blocks inside `parent` in one pass.
///
/// Children are sized for the number of siblings. Explicit blocks are kept
/// as configured and count as occupied; `auto` blocks are picked among
/// what remains. Output order follows `settings`.
///
/// # Errors
/// `Config` if `parent` is too small to split; `AddressSpaceExhausted`
/// naming `requester` and the sibling if no free block is left.
pub fn allocate_siblings(
    requester: &str,
    parent: Ipv4Net,
    settings: &[(String, CidrSetting)],
) -> Result<Vec<(String, Ipv4Net)>> {
    let prefix_len = child_prefix_len(parent, settings.len())?;
    let mut occupied: Vec<Ipv4Net> = settings
        .iter()
        .filter_map(|(_, setting)| match setting {
            CidrSetting::Explicit(net) => Some(*net),
            CidrSetting::Auto => None,
        })
        .collect();

    let mut blocks = Vec::with_capacity(settings.len());
    for (name, setting) in settings {
        let block = match setting {
            CidrSetting::Explicit(net) => *net,
            CidrSetting::Auto => {
                let allocation = allocate(
                    &format!("{requester}/{name}"),
                    parent,
                    prefix_len,
                    occupied,
                )?;
                occupied = allocation.occupied;
                occupied.push(allocation.block);
                allocation.block
            }
        };
        blocks.push((name.clone(), block));
    }

    Ok(blocks)
}

#[cfg(test)]
mod tests {
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    fn net(s: &str) -> Ipv4Net {
        s.parse().unwrap()
    }

    fn auto(names: &[&str]) -> Vec<(String, CidrSetting)> {
        names
            .iter()
            .map(|n| ((*n).to_string(), CidrSetting::Auto))
            .collect()
    }

    #[test]
    fn test_prefix_offset() {
        assert_eq!(child_prefix_offset(0), 0);
        assert_eq!(child_prefix_offset(1), 0);
        assert_eq!(child_prefix_offset(2), 1);
        assert_eq!(child_prefix_offset(3), 2);
        assert_eq!(child_prefix_offset(4), 2);
        assert_eq!(child_prefix_offset(5), 3);
        assert_eq!(child_prefix_offset(8), 3);
        assert_eq!(child_prefix_offset(9), 4);
    }

    #[test]
    fn test_prefix_len_bounds() {
        assert_eq!(child_prefix_len(net("10.0.0.0/16"), 4).unwrap(), 18);
        assert_eq!(child_prefix_len(net("10.0.0.1/32"), 1).unwrap(), 32);
        assert!(matches!(
            child_prefix_len(net("10.0.0.0/31"), 3),
            Err(VpcError::Config(_))
        ));
    }

    #[test]
    fn test_four_siblings_partition_parent() {
        let parent = net("10.0.0.0/16");
        let blocks = allocate_siblings("ci", parent, &auto(&["intranet", "tunnel", "dmz", "maintenance"]))
            .unwrap();

        let mut nets: Vec<Ipv4Net> = blocks.iter().map(|(_, b)| *b).collect();
        nets.sort();
        assert_eq!(
            nets,
            vec![
                net("10.0.0.0/18"),
                net("10.0.64.0/18"),
                net("10.0.128.0/18"),
                net("10.0.192.0/18"),
            ]
        );
        assert_eq!(blocks[0].0, "intranet");
    }

    #[test]
    fn test_siblings_disjoint_and_contained() {
        let parent = net("172.16.0.0/20");
        for count in 1..=9 {
            let names: Vec<String> = (0..count).map(|i| format!("net{i}")).collect();
            let settings: Vec<(String, CidrSetting)> =
                names.iter().map(|n| (n.clone(), CidrSetting::Auto)).collect();
            let blocks = allocate_siblings("env", parent, &settings).unwrap();

            for (i, (_, a)) in blocks.iter().enumerate() {
                assert!(parent.contains(a));
                for (_, b) in &blocks[i + 1..] {
                    assert!(!overlaps(a, b), "{a} overlaps {b}");
                }
            }
        }
    }

    #[test]
    fn test_explicit_blocks_are_trusted_and_avoided() {
        let parent = net("10.0.0.0/16");
        let settings = vec![
            ("intranet".to_string(), CidrSetting::Explicit(net("10.0.0.0/17"))),
            ("dmz".to_string(), CidrSetting::Auto),
        ];
        let blocks = allocate_siblings("ci", parent, &settings).unwrap();
        assert_eq!(blocks[0].1, net("10.0.0.0/17"));
        assert_eq!(blocks[1].1, net("10.0.128.0/17"));
    }

    #[test]
    fn test_exhaustion_is_reported() {
        let parent = net("10.0.0.0/16");
        let settings = vec![
            ("intranet".to_string(), CidrSetting::Explicit(net("10.0.0.0/16"))),
            ("dmz".to_string(), CidrSetting::Auto),
        ];
        let err = allocate_siblings("ci", parent, &settings).unwrap_err();
        match err {
            VpcError::AddressSpaceExhausted {
                requester,
                prefix_len,
                ..
            } => {
                assert_eq!(requester, "ci/dmz");
                assert_eq!(prefix_len, 17);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_pick_returns_none_only_when_everything_overlaps() {
        let parent = net("10.0.0.0/24");
        let mut rng = StdRng::seed_from_u64(1);

        let occupied = vec![net("10.0.0.0/25"), net("10.0.0.128/26")];
        for _ in 0..50 {
            let picked = pick_free_subnet_with(&mut rng, parent, 26, &occupied).unwrap();
            assert_eq!(picked, net("10.0.0.192/26"));
        }

        let occupied = vec![net("10.0.0.0/25"), net("10.0.0.128/25")];
        assert!(pick_free_subnet_with(&mut rng, parent, 26, &occupied).is_none());

        // an occupied block larger than the parent covers everything
        assert!(pick_free_subnet(parent, 28, &[net("10.0.0.0/8")]).is_none());
        // a prefix shorter than the parent's has no candidates
        assert!(pick_free_subnet(parent, 16, &[]).is_none());
    }

    #[test]
    fn test_cidr_setting_parse() {
        assert_eq!("auto".parse::<CidrSetting>().unwrap(), CidrSetting::Auto);
        assert_eq!(
            " 10.1.0.0/16 ".parse::<CidrSetting>().unwrap(),
            CidrSetting::Explicit(net("10.1.0.0/16"))
        );
        assert!("10.1.0.0".parse::<CidrSetting>().is_err());
    }
}
