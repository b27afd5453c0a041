//! Copies animation node values onto a [`Rig`].

use std::collections::HashSet;

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::{
    rig::{curve_name, Rig, Transform},
    sdk::{AnimationNode, NodeKind},
};

/// Channels of a joint node: translation xyz, Euler degrees xyz, scale xyz.
pub const JOINT_CHANNEL_COUNT: usize = 9;

/// Per-axis sign multipliers from SDK space into rig space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AxisMapping {
    pub translation: [f32; 3],
    pub rotation: [f32; 3],
    pub scale: [f32; 3],
}

impl Default for AxisMapping {
    fn default() -> Self {
        Self {
            translation: [1.0, 1.0, -1.0],
            rotation: [1.0, -1.0, -1.0],
            scale: [1.0, 1.0, 1.0],
        }
    }
}

impl AxisMapping {
    /// Left-handed, Z-up engines: Y is flipped for translation and rotation.
    pub fn mirror_y() -> Self {
        Self {
            translation: [1.0, -1.0, 1.0],
            rotation: [1.0, -1.0, -1.0],
            scale: [1.0, 1.0, 1.0],
        }
    }

    /// Offset transform encoded by the first nine joint channel values.
    pub fn joint_offset(&self, values: &[f32]) -> Option<Transform> {
        let values = values.get(..JOINT_CHANNEL_COUNT)?;
        let signed = |start: usize, signs: &[f32; 3]| {
            Vector3::new(
                values[start] * signs[0],
                values[start + 1] * signs[1],
                values[start + 2] * signs[2],
            )
        };

        let degrees = signed(3, &self.rotation);
        Some(Transform {
            translation: signed(0, &self.translation),
            rotation: UnitQuaternion::from_euler_angles(
                degrees.x.to_radians(),
                degrees.y.to_radians(),
                degrees.z.to_radians(),
            ),
            scale: signed(6, &self.scale),
        })
    }
}

/// What one [`NodeApplier::apply`] call touched.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub joints: usize,
    pub morphs: usize,
    pub curves: usize,
    /// Targets missing from the rig and malformed joint nodes.
    pub misses: usize,
}

/// Applies node snapshots to a rig.
///
/// Every call starts from the bind pose, so applying the same snapshot twice
/// yields the same pose as applying it once. Missing targets are skipped and
/// reported once per name for the lifetime of the applier.
#[derive(Debug, Default)]
pub struct NodeApplier {
    mapping: AxisMapping,
    warned: HashSet<String>,
    ignored_kinds: HashSet<i32>,
}

impl NodeApplier {
    pub fn new(mapping: AxisMapping) -> Self {
        Self {
            mapping,
            ..Default::default()
        }
    }

    pub fn mapping(&self) -> &AxisMapping {
        &self.mapping
    }

    /// Names reported as missing so far.
    pub fn warned(&self) -> usize {
        self.warned.len()
    }

    pub fn apply(&mut self, rig: &mut Rig, nodes: &[AnimationNode]) -> ApplyStats {
        rig.reset_pose();
        let mut stats = ApplyStats::default();

        for node in nodes {
            match node.kind {
                NodeKind::Joint => {
                    if self.apply_joint(rig, node) {
                        stats.joints += 1;
                    } else {
                        stats.misses += 1;
                    }
                }
                NodeKind::Blendshape => {
                    for (channel, value) in node.channels() {
                        if rig.set_morph(channel, value) {
                            stats.morphs += 1;
                        } else {
                            self.warn_once("morph target", channel);
                            stats.misses += 1;
                        }
                    }
                }
                NodeKind::Other => {
                    for (channel, value) in node.channels() {
                        let curve = curve_name(&node.name, channel);
                        if rig.set_curve(&curve, value) {
                            stats.curves += 1;
                        } else {
                            self.warn_once("animation curve", &curve);
                            stats.misses += 1;
                        }
                    }
                }
                NodeKind::Unrecognized(raw) => {
                    if self.ignored_kinds.insert(raw) {
                        tracing::debug!(kind = raw, node = %node.name, "ignoring unrecognized node kind");
                    }
                }
            }
        }
        stats
    }

    fn apply_joint(&mut self, rig: &mut Rig, node: &AnimationNode) -> bool {
        let Some(offset) = self.mapping.joint_offset(&node.values) else {
            self.warn_once("joint with too few channels", &node.name);
            return false;
        };
        let Some(bone) = rig.bone_index(&node.name).and_then(|index| rig.bone_mut(index)) else {
            self.warn_once("bone", &node.name);
            return false;
        };

        let bind = bone.bind;
        bone.pose = Transform {
            translation: bind.translation + offset.translation,
            rotation: bind.rotation * offset.rotation,
            scale: bind.scale.component_mul(&offset.scale),
        };
        true
    }

    fn warn_once(&mut self, what: &'static str, name: &str) {
        if self.warned.insert(format!("{what}:{name}")) {
            tracing::warn!(name, "{what} was not found");
        }
    }
}
