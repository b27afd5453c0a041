use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::sdk::NodeKind;

/// Channels a joint node carries, in wire order.
pub const JOINT_CHANNELS: [&str; 9] = ["tx", "ty", "tz", "rx", "ry", "rz", "sx", "sy", "sz"];

/// Character description understood by the reference backend.
///
/// The real SDK consumes a compiled, proprietary character file. The reference
/// backend reads this JSON form from the same opaque byte buffer instead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CharacterDef {
    #[serde(default)]
    pub name: String,
    pub nodes: Vec<NodeDef>,
    #[serde(default = "default_moods")]
    pub moods: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDef {
    pub name: String,
    pub kind: NodeKindDef,
    /// Joint nodes default to the nine transform channels when empty.
    #[serde(default)]
    pub channels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKindDef {
    Joint,
    Blendshape,
    Other,
}

impl From<NodeKindDef> for NodeKind {
    fn from(value: NodeKindDef) -> Self {
        match value {
            NodeKindDef::Joint => NodeKind::Joint,
            NodeKindDef::Blendshape => NodeKind::Blendshape,
            NodeKindDef::Other => NodeKind::Other,
        }
    }
}

fn default_moods() -> Vec<String> {
    vec!["neutral".to_string()]
}

impl CharacterDef {
    /// Parses and validates a character description.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, String> {
        let mut def: CharacterDef =
            serde_json::from_slice(bytes).map_err(|err| format!("character definition: {err}"))?;
        def.normalise()?;
        Ok(def)
    }

    /// Built-in head rig used by the demo binary and tests.
    pub fn demo() -> Self {
        let strings = |names: &[&str]| names.iter().map(|name| name.to_string()).collect();
        Self {
            name: "Demo Head".to_string(),
            nodes: vec![
                NodeDef {
                    name: "jaw".to_string(),
                    kind: NodeKindDef::Joint,
                    channels: strings(&JOINT_CHANNELS),
                },
                NodeDef {
                    name: "head".to_string(),
                    kind: NodeKindDef::Joint,
                    channels: strings(&JOINT_CHANNELS),
                },
                NodeDef {
                    name: "mouth".to_string(),
                    kind: NodeKindDef::Blendshape,
                    channels: strings(&["jawOpen", "lipsPurse", "smile"]),
                },
                NodeDef {
                    name: "CTRL_expressions".to_string(),
                    kind: NodeKindDef::Other,
                    channels: strings(&["browRaiseL", "browRaiseR"]),
                },
            ],
            moods: strings(&["neutral", "positive", "negative"]),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).unwrap_or_default()
    }

    /// Total number of channel values across all nodes.
    pub fn channel_count(&self) -> usize {
        self.nodes.iter().map(|node| node.channels.len()).sum()
    }

    pub fn has_mood(&self, mood: &str) -> bool {
        self.moods.iter().any(|known| known == mood)
    }

    /// Whether the moods required for automatic detection are defined.
    pub fn supports_auto_mood(&self) -> bool {
        ["neutral", "positive", "negative"]
            .iter()
            .all(|mood| self.has_mood(mood))
    }

    fn normalise(&mut self) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("character definition has no animation nodes".to_string());
        }
        if self.moods.is_empty() {
            self.moods = default_moods();
        }

        let mut names = HashSet::new();
        for node in &mut self.nodes {
            if node.name.is_empty() {
                return Err("animation node without a name".to_string());
            }
            if !names.insert(node.name.clone()) {
                return Err(format!("duplicate animation node `{}`", node.name));
            }

            if node.kind == NodeKindDef::Joint {
                if node.channels.is_empty() {
                    node.channels = JOINT_CHANNELS.iter().map(|c| c.to_string()).collect();
                } else if node.channels.len() != JOINT_CHANNELS.len() {
                    return Err(format!(
                        "joint `{}` must have {} channels, found {}",
                        node.name,
                        JOINT_CHANNELS.len(),
                        node.channels.len()
                    ));
                }
            } else if node.channels.is_empty() {
                return Err(format!("node `{}` has no channels", node.name));
            }

            let mut channels = HashSet::new();
            for channel in &node.channels {
                if !channels.insert(channel.as_str()) {
                    return Err(format!(
                        "duplicate channel `{channel}` on node `{}`",
                        node.name
                    ));
                }
            }
        }
        Ok(())
    }
}
