//! Immutable set of logical CPU IDs.
//!
//! All set operations are pure and return a new [`CpuSet`]. The textual form
//! is the Linux cpulist format (`0-3,8,10-11`), which is what cgroups and the
//! container runtime expect for `cpuset.cpus`.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CpuSetError {
    #[error("invalid cpu id `{0}`")]
    InvalidCpu(String),

    #[error("invalid cpu range `{0}`")]
    InvalidRange(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct CpuSet(BTreeSet<usize>);

impl CpuSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.0.contains(&cpu)
    }

    /// Returns true if every CPU of `self` is also in `other`.
    pub fn is_subset_of(&self, other: &CpuSet) -> bool {
        self.0.is_subset(&other.0)
    }

    pub fn is_disjoint(&self, other: &CpuSet) -> bool {
        self.0.is_disjoint(&other.0)
    }

    pub fn union(&self, other: &CpuSet) -> CpuSet {
        CpuSet(self.0.union(&other.0).copied().collect())
    }

    pub fn union_all<'a, I>(&self, others: I) -> CpuSet
    where
        I: IntoIterator<Item = &'a CpuSet>,
    {
        let mut result = self.0.clone();
        for other in others {
            result.extend(other.0.iter().copied());
        }
        CpuSet(result)
    }

    pub fn intersection(&self, other: &CpuSet) -> CpuSet {
        CpuSet(self.0.intersection(&other.0).copied().collect())
    }

    pub fn difference(&self, other: &CpuSet) -> CpuSet {
        CpuSet(self.0.difference(&other.0).copied().collect())
    }

    /// Returns the subset of CPUs matching `predicate`.
    pub fn filter<F>(&self, predicate: F) -> CpuSet
    where
        F: Fn(usize) -> bool,
    {
        CpuSet(self.0.iter().copied().filter(|cpu| predicate(*cpu)).collect())
    }

    /// CPU IDs in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.iter().collect()
    }
}

impl FromIterator<usize> for CpuSet {
    fn from_iter<T: IntoIterator<Item = usize>>(iter: T) -> Self {
        CpuSet(iter.into_iter().collect())
    }
}

impl<const N: usize> From<[usize; N]> for CpuSet {
    fn from(cpus: [usize; N]) -> Self {
        cpus.into_iter().collect()
    }
}

impl fmt::Display for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ranges: Vec<(usize, usize)> = Vec::new();
        for cpu in self.iter() {
            match ranges.last_mut() {
                Some((_, end)) if *end + 1 == cpu => *end = cpu,
                _ => ranges.push((cpu, cpu)),
            }
        }

        let mut first = true;
        for (start, end) in ranges {
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

impl FromStr for CpuSet {
    type Err = CpuSetError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut cpus = BTreeSet::new();
        for group in s.trim().split(',') {
            let group = group.trim();
            if group.is_empty() {
                continue;
            }
            match group.split_once('-') {
                Some((start, end)) => {
                    let start = parse_cpu(start)?;
                    let end = parse_cpu(end)?;
                    if start > end {
                        return Err(CpuSetError::InvalidRange(group.to_string()));
                    }
                    cpus.extend(start..=end);
                }
                None => {
                    cpus.insert(parse_cpu(group)?);
                }
            }
        }
        Ok(CpuSet(cpus))
    }
}

fn parse_cpu(value: &str) -> Result<usize, CpuSetError> {
    value
        .trim()
        .parse::<usize>()
        .map_err(|_| CpuSetError::InvalidCpu(value.to_string()))
}

impl Serialize for CpuSet {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for CpuSet {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn parses_cpulist_with_ranges_and_singletons() {
        let set: CpuSet = "0-3, 8,10-11".parse().expect("valid cpulist");
        assert_eq!(set.to_vec(), vec![0, 1, 2, 3, 8, 10, 11]);
    }

    #[test]
    fn empty_string_is_empty_set() {
        let set: CpuSet = "".parse().expect("empty cpulist");
        assert!(set.is_empty());
        assert_eq!(set.to_string(), "");
    }

    #[test]
    fn rejects_reversed_range() {
        assert_eq!(
            "5-2".parse::<CpuSet>(),
            Err(CpuSetError::InvalidRange("5-2".to_string()))
        );
        assert!("a,1".parse::<CpuSet>().is_err());
    }

    #[test]
    fn display_collapses_consecutive_ids() {
        let set = CpuSet::from([7, 0, 1, 2, 5, 6]);
        assert_eq!(set.to_string(), "0-2,5-7");
    }

    #[test]
    fn set_operations_are_pure() {
        let a = CpuSet::from([0, 1, 2]);
        let b = CpuSet::from([2, 3]);

        assert_eq!(a.union(&b), CpuSet::from([0, 1, 2, 3]));
        assert_eq!(a.intersection(&b), CpuSet::from([2]));
        assert_eq!(a.difference(&b), CpuSet::from([0, 1]));
        assert_eq!(a, CpuSet::from([2, 1, 0]), "operands must be unchanged");
        assert!(CpuSet::from([1]).is_subset_of(&a));
        assert!(CpuSet::from([4]).is_disjoint(&a));
    }

    #[test]
    fn serializes_as_cpulist_string() {
        let set = CpuSet::from([0, 1, 4]);
        let json = serde_json::to_string(&set).expect("serialize");
        assert_eq!(json, "\"0-1,4\"");
        let back: CpuSet = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, set);
    }
}
