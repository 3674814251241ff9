//! Cluster topology and failover-log lookup contract.

use std::collections::HashMap;

use async_trait::async_trait;
use cascade_common::types::{Seqno, Vbucket, Vbuuid};
use cascade_common::{Error, Result};

/// Branch history of one vbucket, newest entry first.
#[derive(Debug, Clone, Default)]
pub struct FailoverLog(pub Vec<(Vbuuid, Seqno)>);

impl FailoverLog {
    /// The latest (vbuuid, seqno) pair, if the history is non-empty.
    pub fn latest(&self) -> Option<(Vbuuid, Seqno)> {
        self.0.first().copied()
    }
}

/// Cluster-side lookups the feed needs before starting streams.
#[async_trait]
pub trait Topology: Send + Sync {
    /// The vbuckets of `bucket` hosted on the current node. Failures map
    /// to [`Error::ClusterInfo`].
    async fn local_vbuckets(&self, pool: &str, bucket: &str) -> Result<Vec<Vbucket>>;

    /// Failover logs for the given vbuckets of `bucket`.
    async fn failover_logs(
        &self,
        pool: &str,
        bucket: &str,
        vbuckets: &[Vbucket],
    ) -> Result<HashMap<Vbucket, FailoverLog>>;
}

/// Resolve the latest branch id for each requested vbucket. An absent or
/// empty history is an [`Error::InvalidVbucket`].
pub(crate) fn latest_branches(
    bucket: &str,
    vbuckets: &[Vbucket],
    logs: &HashMap<Vbucket, FailoverLog>,
) -> Result<Vec<Vbuuid>> {
    let mut vbuuids = Vec::with_capacity(vbuckets.len());
    for &vb in vbuckets {
        let (vbuuid, _) = logs
            .get(&vb)
            .and_then(|log| log.latest())
            .ok_or_else(|| {
                Error::InvalidVbucket(format!("{}: empty failover log for vb {}", bucket, vb))
            })?;
        vbuuids.push(vbuuid);
    }
    Ok(vbuuids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_branch_per_vbucket() {
        let mut logs = HashMap::new();
        logs.insert(0, FailoverLog(vec![(0xAB, 120), (0x1, 0)]));
        logs.insert(1, FailoverLog(vec![(0xCD, 300)]));

        let vbuuids = latest_branches("b", &[0, 1], &logs).unwrap();
        assert_eq!(vbuuids, vec![0xAB, 0xCD]);
    }

    #[test]
    fn empty_history_is_an_error() {
        let mut logs = HashMap::new();
        logs.insert(0, FailoverLog(Vec::new()));
        assert!(latest_branches("b", &[0], &logs).is_err());
        assert!(latest_branches("b", &[7], &logs).is_err());
    }
}
