// src/types.rs

//! Identifier types shared by the DAG engine, the event log and the grid
//! job machinery.

use std::fmt;
use std::str::FromStr;

/// A job identity in the local queue as written to event logs:
/// `cluster.proc.subproc`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CondorId {
    pub cluster: i64,
    pub proc: i64,
    pub subproc: i64,
}

impl CondorId {
    pub fn new(cluster: i64, proc: i64, subproc: i64) -> Self {
        Self {
            cluster,
            proc,
            subproc,
        }
    }

    pub fn proc_id(&self) -> ProcId {
        ProcId::new(self.cluster, self.proc)
    }
}

impl fmt::Display for CondorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.cluster, self.proc, self.subproc)
    }
}

impl FromStr for CondorId {
    type Err = String;

    /// Accepts `17`, `17.0` and `17.0.0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.trim().split('.').collect();
        if parts.is_empty() || parts.len() > 3 {
            return Err(format!("malformed job id '{s}'"));
        }
        let mut nums = [0i64; 3];
        for (slot, part) in nums.iter_mut().zip(parts.iter()) {
            *slot = part
                .parse()
                .map_err(|_| format!("malformed job id '{s}'"))?;
        }
        Ok(CondorId::new(nums[0], nums[1], nums[2]))
    }
}

/// A `(ClusterID, ProcID)` pair identifying a job in the local queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct ProcId {
    pub cluster: i64,
    pub proc: i64,
}

impl ProcId {
    pub fn new(cluster: i64, proc: i64) -> Self {
        Self { cluster, proc }
    }

    pub fn condor_id(&self) -> CondorId {
        CondorId::new(self.cluster, self.proc, 0)
    }
}

impl fmt::Display for ProcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.cluster, self.proc)
    }
}

impl FromStr for ProcId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let id: CondorId = s.parse()?;
        Ok(id.proc_id())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_short_and_long_forms() {
        assert_eq!("17".parse::<CondorId>().unwrap(), CondorId::new(17, 0, 0));
        assert_eq!("17.0".parse::<CondorId>().unwrap(), CondorId::new(17, 0, 0));
        assert_eq!("17.3.1".parse::<CondorId>().unwrap(), CondorId::new(17, 3, 1));
        assert!("17.x".parse::<CondorId>().is_err());
        assert!("1.2.3.4".parse::<CondorId>().is_err());
        assert_eq!("42.7".parse::<ProcId>().unwrap().to_string(), "42.7");
    }
}
