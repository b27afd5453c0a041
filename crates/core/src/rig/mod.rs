use std::collections::{BTreeMap, HashMap};

use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::{
    sdk::{AnimationNode, NodeKind},
    DriverError, Result,
};

/// Name of the curve driven by `channel` of an `Other` node.
pub fn curve_name(node: &str, channel: &str) -> String {
    format!("{node}_{channel}")
}

/// Local bone transform.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transform {
    pub translation: Vector3<f32>,
    pub rotation: UnitQuaternion<f32>,
    pub scale: Vector3<f32>,
}

impl Default for Transform {
    fn default() -> Self {
        Self::identity()
    }
}

impl Transform {
    pub fn identity() -> Self {
        Self {
            translation: Vector3::zeros(),
            rotation: UnitQuaternion::identity(),
            scale: Vector3::repeat(1.0),
        }
    }

    /// Builds a transform from Euler angles in degrees, applied X then Y then Z.
    pub fn from_euler_degrees(translation: [f32; 3], degrees: [f32; 3], scale: [f32; 3]) -> Self {
        Self {
            translation: Vector3::from(translation),
            rotation: UnitQuaternion::from_euler_angles(
                degrees[0].to_radians(),
                degrees[1].to_radians(),
                degrees[2].to_radians(),
            ),
            scale: Vector3::from(scale),
        }
    }

    /// `self` applied on top of `parent`.
    pub fn compose(&self, parent: &Transform) -> Transform {
        Transform {
            translation: parent.translation
                + parent.rotation * parent.scale.component_mul(&self.translation),
            rotation: parent.rotation * self.rotation,
            scale: parent.scale.component_mul(&self.scale),
        }
    }

    pub fn approx_eq(&self, other: &Transform, epsilon: f32) -> bool {
        (self.translation - other.translation).amax() <= epsilon
            && self.rotation.angle_to(&other.rotation) <= epsilon
            && (self.scale - other.scale).amax() <= epsilon
    }
}

#[derive(Debug, Clone)]
pub struct Bone {
    pub name: String,
    pub parent: Option<usize>,
    pub bind: Transform,
    /// Current local pose.
    pub pose: Transform,
}

/// Skeleton plus the named morph targets and curves an animation can drive.
#[derive(Debug, Clone, Default)]
pub struct Rig {
    bones: Vec<Bone>,
    index: HashMap<String, usize>,
    morphs: BTreeMap<String, f32>,
    curves: BTreeMap<String, f32>,
}

impl Rig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a rig with one bone per joint node, one morph target per
    /// blendshape channel and one curve per channel of every other node.
    pub fn matching(nodes: &[AnimationNode]) -> Self {
        let mut rig = Self::new();
        for node in nodes {
            match node.kind {
                NodeKind::Joint => {
                    // duplicate joint names keep the first bone
                    let _ = rig.add_bone(&node.name, None, Transform::identity());
                }
                NodeKind::Blendshape => {
                    for channel in &node.channel_names {
                        rig.add_morph(channel);
                    }
                }
                NodeKind::Other => {
                    for channel in &node.channel_names {
                        rig.add_curve(curve_name(&node.name, channel));
                    }
                }
                NodeKind::Unrecognized(_) => {}
            }
        }
        rig
    }

    pub fn from_description(description: &RigDescription) -> Result<Self> {
        let mut rig = Self::new();
        for bone in &description.bones {
            rig.add_bone(
                &bone.name,
                bone.parent.as_deref(),
                Transform::from_euler_degrees(bone.translation, bone.rotation_degrees, bone.scale),
            )?;
        }
        for morph in &description.morph_targets {
            rig.add_morph(morph);
        }
        for curve in &description.curves {
            rig.add_curve(curve);
        }
        Ok(rig)
    }

    /// Adds a bone posed at its bind transform. Parents must already exist.
    pub fn add_bone(&mut self, name: &str, parent: Option<&str>, bind: Transform) -> Result<usize> {
        if self.index.contains_key(name) {
            return Err(DriverError::msg(format!("duplicate bone `{name}`")));
        }
        let parent = match parent {
            Some(parent) => Some(
                self.bone_index(parent)
                    .ok_or_else(|| DriverError::msg(format!("unknown parent bone `{parent}`")))?,
            ),
            None => None,
        };

        let index = self.bones.len();
        self.bones.push(Bone {
            name: name.to_string(),
            parent,
            bind,
            pose: bind,
        });
        self.index.insert(name.to_string(), index);
        Ok(index)
    }

    pub fn add_morph(&mut self, name: impl Into<String>) {
        self.morphs.entry(name.into()).or_insert(0.0);
    }

    pub fn add_curve(&mut self, name: impl Into<String>) {
        self.curves.entry(name.into()).or_insert(0.0);
    }

    pub fn bones(&self) -> &[Bone] {
        &self.bones
    }

    pub fn bone_index(&self, name: &str) -> Option<usize> {
        self.index.get(name).copied()
    }

    pub fn bone(&self, name: &str) -> Option<&Bone> {
        self.bone_index(name).map(|index| &self.bones[index])
    }

    pub fn bone_mut(&mut self, index: usize) -> Option<&mut Bone> {
        self.bones.get_mut(index)
    }

    /// Sets a morph target weight. Returns `false` for unknown targets.
    pub fn set_morph(&mut self, name: &str, weight: f32) -> bool {
        match self.morphs.get_mut(name) {
            Some(slot) => {
                *slot = weight;
                true
            }
            None => false,
        }
    }

    pub fn morph(&self, name: &str) -> Option<f32> {
        self.morphs.get(name).copied()
    }

    pub fn morphs(&self) -> &BTreeMap<String, f32> {
        &self.morphs
    }

    /// Sets a curve value. Returns `false` for unknown curves.
    pub fn set_curve(&mut self, name: &str, value: f32) -> bool {
        match self.curves.get_mut(name) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }

    pub fn curve(&self, name: &str) -> Option<f32> {
        self.curves.get(name).copied()
    }

    pub fn curves(&self) -> &BTreeMap<String, f32> {
        &self.curves
    }

    /// Returns every bone to its bind pose.
    pub fn reset_pose(&mut self) {
        for bone in &mut self.bones {
            bone.pose = bone.bind;
        }
    }

    /// Pose of bone `index` in rig space.
    pub fn model_pose(&self, index: usize) -> Option<Transform> {
        let bone = self.bones.get(index)?;
        match bone.parent {
            Some(parent) => Some(bone.pose.compose(&self.model_pose(parent)?)),
            None => Some(bone.pose),
        }
    }
}

/// Serialized form of a [`Rig`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RigDescription {
    #[serde(default)]
    pub bones: Vec<BoneDescription>,
    #[serde(default)]
    pub morph_targets: Vec<String>,
    #[serde(default)]
    pub curves: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoneDescription {
    pub name: String,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub translation: [f32; 3],
    #[serde(default)]
    pub rotation_degrees: [f32; 3],
    #[serde(default = "unit_scale")]
    pub scale: [f32; 3],
}

fn unit_scale() -> [f32; 3] {
    [1.0; 3]
}

impl RigDescription {
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: &std::path::Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str, kind: NodeKind, channels: &[&str]) -> AnimationNode {
        AnimationNode {
            name: name.to_string(),
            kind,
            channel_names: channels.iter().map(|c| c.to_string()).collect(),
            values: vec![0.0; channels.len()],
        }
    }

    #[test]
    fn matching_rig_covers_every_target() {
        let nodes = vec![
            node("jaw", NodeKind::Joint, &["tx", "ty", "tz", "rx", "ry", "rz", "sx", "sy", "sz"]),
            node("mouth", NodeKind::Blendshape, &["jawOpen", "smile"]),
            node("CTRL", NodeKind::Other, &["browRaiseL"]),
            node("future", NodeKind::Unrecognized(9), &["x"]),
        ];
        let rig = Rig::matching(&nodes);

        assert_eq!(rig.bones().len(), 1);
        assert!(rig.bone("jaw").is_some());
        assert_eq!(rig.morph("smile"), Some(0.0));
        assert_eq!(rig.curve("CTRL_browRaiseL"), Some(0.0));
        assert_eq!(rig.curves().len(), 1);
    }

    #[test]
    fn builds_from_json_description() {
        let description = RigDescription::from_json_str(
            r#"{
                "bones": [
                    { "name": "root", "translation": [0, 1, 0] },
                    { "name": "head", "parent": "root", "translation": [0, 2, 0] }
                ],
                "morph_targets": ["jawOpen"],
                "curves": ["CTRL_brow"]
            }"#,
        )
        .unwrap();
        let rig = Rig::from_description(&description).unwrap();

        let head = rig.bone_index("head").unwrap();
        assert_eq!(rig.bones()[head].parent, Some(0));
        assert_eq!(rig.bones()[head].bind.scale, Vector3::repeat(1.0));
        let model = rig.model_pose(head).unwrap();
        assert!((model.translation - Vector3::new(0.0, 3.0, 0.0)).norm() < 1e-6);
    }

    #[test]
    fn rejects_duplicate_and_orphan_bones() {
        let mut rig = Rig::new();
        rig.add_bone("a", None, Transform::identity()).unwrap();
        assert!(rig.add_bone("a", None, Transform::identity()).is_err());
        assert!(rig.add_bone("b", Some("missing"), Transform::identity()).is_err());
    }

    #[test]
    fn unknown_targets_are_reported() {
        let mut rig = Rig::new();
        rig.add_morph("smile");
        assert!(rig.set_morph("smile", 0.5));
        assert!(!rig.set_morph("frown", 0.5));
        assert!(!rig.set_curve("anything", 1.0));
        assert_eq!(rig.morph("smile"), Some(0.5));
    }

    #[test]
    fn reset_returns_to_bind() {
        let mut rig = Rig::new();
        let bind = Transform::from_euler_degrees([1.0, 0.0, 0.0], [0.0, 90.0, 0.0], [1.0; 3]);
        let index = rig.add_bone("jaw", None, bind).unwrap();
        rig.bone_mut(index).unwrap().pose = Transform::identity();

        rig.reset_pose();
        assert!(rig.bones()[index].pose.approx_eq(&bind, 1e-6));
    }
}
