//! Ranking of backup candidate nodes per replica set.

use std::collections::HashMap;

use crate::store::{Config, MetaStore};
use crate::utils::{PitrError, ResultExt};

/// Score of a node nobody said anything about.
pub const DEFAULT_SCORE: f64 = 1.0;

/// Replica set member state as seen by the node's agent.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum NodeState {
    Primary,
    #[default]
    Secondary,
    Other,
}

/// Health of one subsystem an agent watches.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct SubsysStatus {
    pub ok: bool,
    pub err: String,
}

impl SubsysStatus {
    pub fn ok() -> Self {
        SubsysStatus {
            ok: true,
            err: String::new(),
        }
    }

    pub fn failed(err: impl Into<String>) -> Self {
        SubsysStatus {
            ok: false,
            err: err.into(),
        }
    }
}

/// Status an agent reports about itself and its node.
#[derive(Debug, PartialEq, Eq, Clone, Default)]
pub struct AgentStat {
    /// Node id, `host:port`.
    pub node: String,
    pub rs: String,
    pub state: NodeState,
    pub hidden: bool,

    pub agent: SubsysStatus,
    pub node_status: SubsysStatus,
    pub storage: SubsysStatus,
}

impl AgentStat {
    /// Errors of the failing subsystems; empty if healthy.
    pub fn errors(&self) -> Vec<String> {
        [
            ("agent", &self.agent),
            ("node", &self.node_status),
            ("storage", &self.storage),
        ]
        .into_iter()
        .filter(|(_, s)| !s.ok)
        .map(|(what, s)| format!("{}: {}", what, s.err))
        .collect()
    }

    #[inline]
    pub fn is_ok(&self) -> bool {
        self.agent.ok && self.node_status.ok && self.storage.ok
    }
}

/// Nodes of one replica set grouped by equal score.
#[derive(Debug, Default, Clone, PartialEq)]
struct NodeScores {
    groups: Vec<(f64, Vec<String>)>,
}

impl NodeScores {
    fn add(&mut self, node: &str, score: f64) {
        match self.groups.iter_mut().find(|(s, _)| *s == score) {
            Some((_, nodes)) => nodes.push(node.into()),
            None => self.groups.push((score, vec![node.into()])),
        }
    }

    fn list(&self) -> Vec<Vec<String>> {
        let mut groups = self.groups.clone();
        groups.sort_by(|a, b| b.0.total_cmp(&a.0));
        groups.into_iter().map(|(_, nodes)| nodes).collect()
    }
}

/// Per replica set candidate groups, best score first.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct NodesPriority {
    m: HashMap<String, NodeScores>,
}

impl NodesPriority {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, rs: &str, node: &str, score: f64) {
        self.m.entry(rs.into()).or_default().add(node, score);
    }

    /// Groups of equally scored nodes of `rs`, highest score first.
    pub fn rs(&self, rs: &str) -> Vec<Vec<String>> {
        self.m.get(rs).map(|s| s.list()).unwrap_or_default()
    }

    /// Replica sets with at least one candidate.
    pub fn replsets(&self) -> impl Iterator<Item = &str> {
        self.m.keys().map(|rs| rs.as_str())
    }
}

/// Scores the healthy agents. With a non-empty priority map in the config,
/// nodes get their configured score and unknown ones the default. Otherwise
/// a per-node coefficient, if given, scales the default; without one,
/// primaries are halved and hidden nodes doubled.
pub fn nodes_priority(
    config: &Config,
    coefficients: Option<&HashMap<String, f64>>,
    agents: &[AgentStat],
) -> NodesPriority {
    let configured = &config.backup.priority;
    let score = |a: &AgentStat| -> f64 {
        if !configured.is_empty() {
            return match configured.get(&a.node) {
                Some(&s) if s >= 0.0 => s,
                _ => DEFAULT_SCORE,
            };
        }
        if let Some(&c) = coefficients.and_then(|m| m.get(&a.node)) {
            if c.is_finite() {
                return DEFAULT_SCORE * c;
            }
        }
        match (a.state, a.hidden) {
            (NodeState::Primary, _) => DEFAULT_SCORE / 2.0,
            (_, true) => DEFAULT_SCORE * 2.0,
            _ => DEFAULT_SCORE,
        }
    };

    let mut prio = NodesPriority::new();
    for agent in agents {
        if !agent.is_ok() {
            pf_debug!("skipping {}/{}: {:?}",
                      agent.rs, agent.node, agent.errors());
            continue;
        }
        prio.add(&agent.rs, &agent.node, score(agent));
    }
    prio
}

/// `nodes_priority` with the cluster config read from the store.
pub async fn bcp_nodes_priority(
    store: &dyn MetaStore,
    coefficients: Option<&HashMap<String, f64>>,
    agents: &[AgentStat],
) -> Result<NodesPriority, PitrError> {
    let config = store.get_config().await.wrap_err("get config")?;
    Ok(nodes_priority(&config, coefficients, agents))
}

#[cfg(test)]
mod priority_tests {
    use super::*;
    use crate::store::{BackupConf, MemStore};

    fn agent(node: &str, state: NodeState, hidden: bool) -> AgentStat {
        AgentStat {
            node: node.into(),
            rs: "rs0".into(),
            state,
            hidden,
            agent: SubsysStatus::ok(),
            node_status: SubsysStatus::ok(),
            storage: SubsysStatus::ok(),
        }
    }

    fn rs0_agents() -> Vec<AgentStat> {
        vec![
            agent("a:27017", NodeState::Primary, false),
            agent("b:27017", NodeState::Secondary, false),
            agent("c:27017", NodeState::Secondary, true),
        ]
    }

    #[test]
    fn default_rules() {
        let prio = nodes_priority(&Config::default(), None, &rs0_agents());
        assert_eq!(
            prio.rs("rs0"),
            vec![
                vec!["c:27017".to_string()],
                vec!["b:27017".to_string()],
                vec!["a:27017".to_string()],
            ]
        );
        assert!(prio.rs("rs9").is_empty());
    }

    #[test]
    fn configured_priority_wins() {
        let config = Config {
            backup: BackupConf {
                priority: HashMap::from([
                    ("a:27017".to_string(), 2.5),
                    ("c:27017".to_string(), -1.0),
                ]),
            },
        };
        let prio = nodes_priority(&config, None, &rs0_agents());
        // b and c both end up with the default score
        assert_eq!(prio.rs("rs0")[0], vec!["a:27017".to_string()]);
        assert_eq!(prio.rs("rs0")[1].len(), 2);
    }

    #[test]
    fn coefficients_scale_default() {
        let coeff = HashMap::from([("b:27017".to_string(), 3.0)]);
        let agents = rs0_agents();
        let prio = nodes_priority(&Config::default(), Some(&coeff), &agents);
        assert_eq!(prio.rs("rs0")[0], vec!["b:27017".to_string()]);
        assert_eq!(prio.rs("rs0")[1], vec!["c:27017".to_string()]);
    }

    #[test]
    fn unhealthy_excluded() {
        let mut agents = rs0_agents();
        agents[1].storage = SubsysStatus::failed("no access");
        assert_eq!(agents[1].errors(), vec!["storage: no access".to_string()]);
        let prio = nodes_priority(&Config::default(), None, &agents);
        let all: Vec<String> = prio.rs("rs0").into_iter().flatten().collect();
        assert!(!all.contains(&"b:27017".to_string()));
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn reads_config_from_store() -> Result<(), PitrError> {
        let store = MemStore::new();
        store.set_config(Config::from_toml(
            "[backup.priority]\n\"b:27017\" = 9.0\n",
        )?);
        let prio = bcp_nodes_priority(&store, None, &rs0_agents()).await?;
        assert_eq!(prio.rs("rs0")[0], vec!["b:27017".to_string()]);
        assert_eq!(prio.replsets().collect::<Vec<_>>(), vec!["rs0"]);
        Ok(())
    }
}
