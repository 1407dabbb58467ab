//! Per-call output of the open-set head.

use candle_core::Tensor;
use serde::ser::{Serialize, SerializeMap, Serializer};

/// Record keys in the order [`MetricRecord::entries`] yields them.
pub const RECORD_KEYS: [&str; 15] = [
    "gap",
    "embed_fea",
    "embed_gen",
    "norm_fea",
    "sim_fea2cen",
    "dotproduct_fea2cen",
    "cosine_fea2cen",
    "normweight_fea2cen",
    "dis_fea2cen",
    "dis_gen2cen",
    "dis_gen2ori",
    "energy",
    "pnorm",
    "logits",
    "thresholds",
];

/// Tensors produced by one forward call.
///
/// Every row follows the order of the input batch (or of the generated
/// batch for the `*_gen*` entries). Branches that did not run are `None`
/// rather than missing, so the key set never changes between calls.
#[derive(Debug, Clone)]
pub struct MetricRecord {
    /// Globally pooled backbone features `[n, feat_dim]`.
    pub gap: Tensor,
    /// Embeddings of the real features `[n, embed_dim]`.
    pub embed_fea: Tensor,
    /// Embeddings of generated features `[k, embed_dim]`.
    pub embed_gen: Option<Tensor>,
    /// Per-row L2 norm of `embed_fea`, `[n, 1]`.
    pub norm_fea: Tensor,
    /// Configured similarity against centroids `[n, c]`.
    pub sim_fea2cen: Tensor,
    pub dotproduct_fea2cen: Tensor,
    pub cosine_fea2cen: Tensor,
    pub normweight_fea2cen: Tensor,
    /// Configured distance against centroids `[n, c]`.
    pub dis_fea2cen: Tensor,
    /// Distance of generated embeddings to centroids `[k, c]`.
    pub dis_gen2cen: Option<Tensor>,
    /// Distance of generated embeddings to the origin `[k, 1]`.
    pub dis_gen2ori: Option<Tensor>,
    /// Log-sum-exp of `normweight_fea2cen`, `[n]`.
    pub energy: Tensor,
    /// p-norm of `normweight_fea2cen`, `[n]`.
    pub pnorm: Tensor,
    /// Classifier output `[n, c]`.
    pub logits: Option<Tensor>,
    /// Thresholds supplied at construction.
    pub thresholds: Option<Tensor>,
}

impl MetricRecord {
    /// All keys with their tensors, in [`RECORD_KEYS`] order.
    pub fn entries(&self) -> [(&'static str, Option<&Tensor>); 15] {
        [
            ("gap", Some(&self.gap)),
            ("embed_fea", Some(&self.embed_fea)),
            ("embed_gen", self.embed_gen.as_ref()),
            ("norm_fea", Some(&self.norm_fea)),
            ("sim_fea2cen", Some(&self.sim_fea2cen)),
            ("dotproduct_fea2cen", Some(&self.dotproduct_fea2cen)),
            ("cosine_fea2cen", Some(&self.cosine_fea2cen)),
            ("normweight_fea2cen", Some(&self.normweight_fea2cen)),
            ("dis_fea2cen", Some(&self.dis_fea2cen)),
            ("dis_gen2cen", self.dis_gen2cen.as_ref()),
            ("dis_gen2ori", self.dis_gen2ori.as_ref()),
            ("energy", Some(&self.energy)),
            ("pnorm", Some(&self.pnorm)),
            ("logits", self.logits.as_ref()),
            ("thresholds", self.thresholds.as_ref()),
        ]
    }

    /// Look up one entry. The outer `None` means the key is unknown, the
    /// inner `None` that the branch producing it did not run.
    pub fn get(&self, key: &str) -> Option<Option<&Tensor>> {
        self.entries()
            .into_iter()
            .find(|(name, _)| *name == key)
            .map(|(_, tensor)| tensor)
    }

    /// Shapes of every entry, `None` for absent branches.
    pub fn summary(&self) -> RecordSummary {
        RecordSummary {
            shapes: self
                .entries()
                .into_iter()
                .map(|(name, tensor)| (name, tensor.map(|t| t.dims().to_vec())))
                .collect(),
        }
    }
}

/// Key-to-shape view of a [`MetricRecord`], serialized as an ordered map.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordSummary {
    shapes: Vec<(&'static str, Option<Vec<usize>>)>,
}

impl RecordSummary {
    /// Shape of `key`; outer `None` for unknown keys.
    pub fn shape(&self, key: &str) -> Option<Option<&[usize]>> {
        self.shapes
            .iter()
            .find(|(name, _)| *name == key)
            .map(|(_, shape)| shape.as_deref())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, Option<&[usize]>)> + '_ {
        self.shapes.iter().map(|(name, shape)| (*name, shape.as_deref()))
    }
}

impl Serialize for RecordSummary {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.shapes.len()))?;
        for (name, shape) in &self.shapes {
            map.serialize_entry(name, shape)?;
        }
        map.end()
    }
}
