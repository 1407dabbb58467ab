//! Backbone output width resolution.
//!
//! A backbone that declares its width is taken at its word. Otherwise the
//! width is read off the final leaf of its layout: starting at the root,
//! repeatedly step into the last child until a conv, linear or batch-norm
//! leaf is reached. An empty trailing container (an identity shortcut, for
//! instance) says nothing about width, so the walk steps into the child
//! before it instead.

use tracing::debug;

use crate::backbone::{Backbone, LayerNode};
use crate::error::{OpenSetError, OpenSetResult};

/// Channel count of the feature map `backbone` produces.
///
/// # Errors
/// `OpenSetError::DimensionProbe` when the backbone declares nothing and its
/// final path ends without a qualifying leaf.
pub fn output_dim(backbone: &dyn Backbone) -> OpenSetResult<usize> {
    if let Some(dim) = backbone.declared_output_dim() {
        debug!(backbone = backbone.name(), dim, "Using declared backbone width");
        return Ok(dim);
    }

    let layout = backbone.layout();
    let dim = walk_layout(&layout).map_err(|reason| OpenSetError::DimensionProbe {
        backbone: backbone.name().to_string(),
        reason,
    })?;
    debug!(backbone = backbone.name(), dim, "Resolved backbone width from layout");
    Ok(dim)
}

/// Follow the last-child path from `root` to a width-bearing leaf.
///
/// Returns a human readable reason when the path dead-ends.
pub fn walk_layout(root: &LayerNode) -> Result<usize, String> {
    let mut path = Vec::new();
    let mut current = root;
    loop {
        match current {
            LayerNode::Conv2d { out_channels } => return Ok(*out_channels),
            LayerNode::Linear { out_features } => return Ok(*out_features),
            LayerNode::BatchNorm2d { num_features } => return Ok(*num_features),
            LayerNode::Opaque { kind } => {
                path.push(current.label());
                return Err(format!(
                    "final path ends at '{}', which carries no channel count ({})",
                    kind,
                    path.join(" > ")
                ));
            }
            LayerNode::Container { .. } => {
                path.push(current.label());
                current = terminal_child(current).ok_or_else(|| {
                    format!("container has no usable children ({})", path.join(" > "))
                })?;
            }
        }
    }
}

fn terminal_child(node: &LayerNode) -> Option<&LayerNode> {
    match node.children() {
        [] => None,
        [.., previous, last] if last.is_empty_container() => Some(previous),
        [.., last] => Some(last),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stub::StubBackbone;

    #[test]
    fn test_linear_leaf() {
        let layout = LayerNode::container(
            "mlp",
            vec![LayerNode::linear(256), LayerNode::opaque("ReLU"), LayerNode::linear(96)],
        );
        assert_eq!(walk_layout(&layout), Ok(96));
    }

    #[test]
    fn test_conv_leaf_nested() {
        let layout = LayerNode::container(
            "features",
            vec![
                LayerNode::conv(32),
                LayerNode::container(
                    "stage",
                    vec![LayerNode::container("block", vec![LayerNode::conv(48), LayerNode::conv(80)])],
                ),
            ],
        );
        assert_eq!(walk_layout(&layout), Ok(80));
    }

    #[test]
    fn test_batch_norm_leaf() {
        let layout = LayerNode::container(
            "net",
            vec![LayerNode::conv(64), LayerNode::batch_norm(64)],
        );
        assert_eq!(walk_layout(&layout), Ok(64));
    }

    #[test]
    fn test_empty_trailing_container_is_skipped() {
        let block = LayerNode::container(
            "block",
            vec![
                LayerNode::conv(128),
                LayerNode::batch_norm(128),
                LayerNode::container("shortcut", vec![]),
            ],
        );
        let layout = LayerNode::container("net", vec![LayerNode::conv(16), block]);
        assert_eq!(walk_layout(&layout), Ok(128));
    }

    #[test]
    fn test_non_empty_trailing_container_is_followed() {
        let block = LayerNode::container(
            "block",
            vec![
                LayerNode::batch_norm(128),
                LayerNode::container("shortcut", vec![LayerNode::conv(256), LayerNode::batch_norm(256)]),
            ],
        );
        assert_eq!(walk_layout(&block), Ok(256));
    }

    #[test]
    fn test_opaque_tail_is_an_error() {
        let layout = LayerNode::container(
            "net",
            vec![LayerNode::conv(128), LayerNode::opaque("Flatten")],
        );
        let reason = walk_layout(&layout).unwrap_err();
        assert!(reason.contains("Flatten"), "reason: {}", reason);
    }

    #[test]
    fn test_empty_root_is_an_error() {
        let layout = LayerNode::container("net", vec![]);
        assert!(walk_layout(&layout).is_err());

        let only_empty = LayerNode::container("net", vec![LayerNode::container("tail", vec![])]);
        assert!(walk_layout(&only_empty).is_err());
    }

    #[test]
    fn test_declared_width_wins_over_layout() {
        let backbone = StubBackbone::new(1152, (1, 1))
            .with_layout(LayerNode::container(
                "lenet",
                vec![LayerNode::conv(128), LayerNode::opaque("Flatten")],
            ))
            .with_declared_dim(1152);
        assert_eq!(output_dim(&backbone).unwrap(), 1152);
    }

    #[test]
    fn test_unresolvable_backbone_is_configuration_error() {
        let backbone = StubBackbone::new(8, (2, 2)).with_layout(LayerNode::container(
            "broken",
            vec![LayerNode::opaque("Identity")],
        ));
        let err = output_dim(&backbone).unwrap_err();
        assert!(err.is_configuration());
        assert!(matches!(err, OpenSetError::DimensionProbe { ref backbone, .. } if backbone == "stub"));
    }
}
