//! Static narrative graph model.
//!
//! The graph is built once at startup and never mutated. All path
//! computation is a pure function of the played-scenes sequence, so callers
//! can recompute on every update.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use cinewire_schema::Emotion;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    Scene,
    /// Synthetic branch point. Never played directly; visited through its
    /// branch-output scenes.
    Decision,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphNode {
    pub id: String,
    pub role: NodeRole,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphEdge {
    pub from: String,
    pub to: String,
    /// Emotion label shown on decision-to-branch edges.
    #[serde(default)]
    pub trigger: Option<Emotion>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum GraphError {
    #[error("edge references unknown node `{0}`")]
    UnknownEdgeNode(String),
    #[error("decision `{0}` lists unknown branch output `{1}`")]
    UnknownBranchOutput(String, String),
    #[error("branch outputs registered for `{0}`, which is not a decision node")]
    OutputsOnNonDecision(String),
}

/// Immutable directed graph of scene, decision, and ending nodes.
#[derive(Debug, Clone)]
pub struct StoryGraph {
    nodes: Vec<GraphNode>,
    edges: Vec<GraphEdge>,
    decision_outputs: HashMap<String, Vec<String>>,
}

impl StoryGraph {
    pub fn new(
        nodes: Vec<GraphNode>,
        edges: Vec<GraphEdge>,
        decision_outputs: HashMap<String, Vec<String>>,
    ) -> Result<Self, GraphError> {
        let ids: HashSet<&str> = nodes.iter().map(|n| n.id.as_str()).collect();
        let roles: HashMap<&str, NodeRole> =
            nodes.iter().map(|n| (n.id.as_str(), n.role)).collect();

        for edge in &edges {
            for end in [&edge.from, &edge.to] {
                if !ids.contains(end.as_str()) {
                    return Err(GraphError::UnknownEdgeNode(end.clone()));
                }
            }
        }
        for (decision, outputs) in &decision_outputs {
            match roles.get(decision.as_str()) {
                Some(NodeRole::Decision) => {}
                _ => return Err(GraphError::OutputsOnNonDecision(decision.clone())),
            }
            for output in outputs {
                if !ids.contains(output.as_str()) {
                    return Err(GraphError::UnknownBranchOutput(
                        decision.clone(),
                        output.clone(),
                    ));
                }
            }
        }

        Ok(Self {
            nodes,
            edges,
            decision_outputs,
        })
    }

    pub fn nodes(&self) -> &[GraphNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[GraphEdge] {
        &self.edges
    }

    pub fn branch_outputs(&self, decision_id: &str) -> &[String] {
        self.decision_outputs
            .get(decision_id)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// A scene node is visited iff its id appears in `played`. A decision
    /// node is visited iff any of its branch outputs appears in `played`.
    pub fn is_visited(&self, node_id: &str, played: &[String]) -> bool {
        let played: HashSet<&str> = played.iter().map(String::as_str).collect();
        self.is_visited_set(node_id, &played)
    }

    fn is_visited_set(&self, node_id: &str, played: &HashSet<&str>) -> bool {
        if let Some(outputs) = self.decision_outputs.get(node_id) {
            return outputs.iter().any(|o| played.contains(o.as_str()));
        }
        played.contains(node_id)
    }

    /// Node ids unlocked by the path actually taken.
    pub fn visited_nodes(&self, played: &[String]) -> HashSet<&str> {
        let played_set: HashSet<&str> = played.iter().map(String::as_str).collect();
        self.nodes
            .iter()
            .filter(|n| self.is_visited_set(&n.id, &played_set))
            .map(|n| n.id.as_str())
            .collect()
    }

    /// Edge (u,v) is active iff both endpoints are visited. Branches not
    /// taken stay dormant even though the graph is fully known upfront.
    pub fn active_edges(&self, played: &[String]) -> HashSet<(&str, &str)> {
        let played_set: HashSet<&str> = played.iter().map(String::as_str).collect();
        self.edges
            .iter()
            .filter(|e| {
                self.is_visited_set(&e.from, &played_set)
                    && self.is_visited_set(&e.to, &played_set)
            })
            .map(|e| (e.from.as_str(), e.to.as_str()))
            .collect()
    }

    /// The built-in mystery story: three linear scenes, three branch points,
    /// five endings.
    pub fn the_inheritance() -> Self {
        fn scene(id: &str, label: &str) -> GraphNode {
            GraphNode {
                id: id.into(),
                role: NodeRole::Scene,
                label: label.into(),
            }
        }
        fn decision(id: &str, label: &str) -> GraphNode {
            GraphNode {
                id: id.into(),
                role: NodeRole::Decision,
                label: label.into(),
            }
        }
        fn edge(from: &str, to: &str) -> GraphEdge {
            GraphEdge {
                from: from.into(),
                to: to.into(),
                trigger: None,
            }
        }
        fn branch(from: &str, to: &str, trigger: Emotion) -> GraphEdge {
            GraphEdge {
                from: from.into(),
                to: to.into(),
                trigger: Some(trigger),
            }
        }

        let nodes = vec![
            scene("opening", "The Letter"),
            scene("foyer", "Grand Foyer"),
            scene("sound_upstairs", "Upstairs"),
            decision("decision_1", "BRANCH"),
            scene("upstairs_door", "Upstairs Door"),
            scene("study_reveal", "The Study"),
            scene("figure_appears", "Stranger"),
            scene("hidden_room", "Hidden Room"),
            scene("foyer_detail", "Clue"),
            decision("decision_2", "BRANCH"),
            scene("conspiracy_deep", "Conspiracy"),
            scene("twist_reveal", "Mirror"),
            scene("dark_humor_beat", "Dark Humor"),
            scene("narrator_explains", "Backstory"),
            decision("decision_3", "ENDING"),
            scene("ending_solve", "Solved"),
            scene("ending_bittersweet", "Bitter"),
            scene("ending_twist", "Twist"),
            scene("ending_humorous", "Cat Wins"),
            scene("ending_supernatural", "Haunted"),
        ];

        let edges = vec![
            edge("opening", "foyer"),
            edge("foyer", "sound_upstairs"),
            edge("sound_upstairs", "decision_1"),
            branch("decision_1", "upstairs_door", Emotion::Engaged),
            branch("decision_1", "figure_appears", Emotion::Bored),
            branch("decision_1", "foyer_detail", Emotion::Confused),
            edge("upstairs_door", "study_reveal"),
            edge("figure_appears", "hidden_room"),
            edge("foyer_detail", "upstairs_door"),
            edge("study_reveal", "decision_2"),
            edge("hidden_room", "decision_2"),
            branch("decision_2", "conspiracy_deep", Emotion::Engaged),
            branch("decision_2", "twist_reveal", Emotion::Bored),
            branch("decision_2", "dark_humor_beat", Emotion::Amused),
            branch("decision_2", "narrator_explains", Emotion::Confused),
            edge("conspiracy_deep", "decision_3"),
            edge("twist_reveal", "decision_3"),
            edge("dark_humor_beat", "decision_3"),
            edge("narrator_explains", "decision_3"),
            branch("decision_3", "ending_solve", Emotion::Engaged),
            branch("decision_3", "ending_bittersweet", Emotion::Tense),
            branch("decision_3", "ending_twist", Emotion::Surprised),
            branch("decision_3", "ending_humorous", Emotion::Amused),
            branch("decision_3", "ending_supernatural", Emotion::Confused),
        ];

        let decision_outputs = HashMap::from([
            (
                "decision_1".to_string(),
                vec![
                    "upstairs_door".to_string(),
                    "figure_appears".to_string(),
                    "foyer_detail".to_string(),
                ],
            ),
            (
                "decision_2".to_string(),
                vec![
                    "conspiracy_deep".to_string(),
                    "twist_reveal".to_string(),
                    "dark_humor_beat".to_string(),
                    "narrator_explains".to_string(),
                ],
            ),
            (
                "decision_3".to_string(),
                vec![
                    "ending_solve".to_string(),
                    "ending_bittersweet".to_string(),
                    "ending_twist".to_string(),
                    "ending_humorous".to_string(),
                    "ending_supernatural".to_string(),
                ],
            ),
        ]);

        Self::new(nodes, edges, decision_outputs)
            .unwrap_or_else(|e| panic!("built-in story graph invalid: {e}"))
    }
}
