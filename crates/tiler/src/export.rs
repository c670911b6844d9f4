//! Octree → `tileset.json` + one `.pnts` payload per non-empty node.

use crate::cancel::CancellationToken;
use crate::error::{Result, TilerError};
use crate::geom::{Aabb, Baseline};
use crate::octree::{Octree, OctreeNode};
use glam::DVec3;
use pnts::PntsTile;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const TILESET_FILE: &str = "tileset.json";
pub const TILES_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tileset {
    pub asset: Asset,
    pub geometric_error: f64,
    pub root: Tile,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub version: String,
    pub generator: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Refine {
    Add,
    Replace,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingVolume {
    /// Center followed by the x, y and z half-axis vectors.
    #[serde(rename = "box")]
    pub oriented_box: [f64; 12],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub uri: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tile {
    pub bounding_volume: BoundingVolume,
    pub geometric_error: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refine: Option<Refine>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Content>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<Tile>,
}

/// What an export wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExportSummary {
    pub nodes: usize,
    pub payloads: usize,
    pub points: usize,
    pub bytes: u64,
}

fn bounding_volume(bounds: &Aabb, baseline: Baseline) -> BoundingVolume {
    let (center, half) = if bounds.is_empty() {
        (baseline.0, DVec3::ZERO)
    } else {
        (
            baseline.to_ecef(bounds.center()),
            bounds.extent().as_dvec3() * 0.5,
        )
    };

    BoundingVolume {
        oriented_box: [
            center.x, center.y, center.z, //
            half.x, 0.0, 0.0, //
            0.0, half.y, 0.0, //
            0.0, 0.0, half.z,
        ],
    }
}

fn manifest_tile(node: &OctreeNode, baseline: Baseline) -> Tile {
    Tile {
        bounding_volume: bounding_volume(&node.bounds, baseline),
        geometric_error: node.geometric_error,
        refine: None,
        content: node.has_content().then(|| Content {
            uri: node.content_uri(),
        }),
        children: node
            .children
            .iter()
            .map(|child| manifest_tile(child, baseline))
            .collect(),
    }
}

/// Manifest for `tree`; positions in the tree are relative to `baseline`.
pub fn build_tileset(tree: &Octree, baseline: Baseline) -> Tileset {
    let mut root = manifest_tile(&tree.root, baseline);
    root.refine = Some(Refine::Add);

    Tileset {
        asset: Asset {
            version: TILES_VERSION.to_owned(),
            generator: concat!("tiler ", env!("CARGO_PKG_VERSION")).to_owned(),
        },
        geometric_error: tree.root.geometric_error * 2.0,
        root,
    }
}

/// Payload for one node: positions relative to the node's own box centre.
pub fn node_payload(tree: &Octree, node: &OctreeNode, baseline: Baseline) -> PntsTile {
    let center = node.bounds.center();
    let mut tile = PntsTile::with_capacity(baseline.to_ecef(center).to_array(), node.retained());
    for p in tree.stream(node) {
        tile.push(
            (p.position - center).to_array(),
            p.color,
            p.intensity,
            p.classification,
        );
    }
    tile
}

/// Serializes a built tree into `out_dir`.
pub struct TileExporter<'a> {
    out_dir: &'a Path,
    baseline: Baseline,
    cancel: &'a CancellationToken,
}

impl<'a> TileExporter<'a> {
    pub fn new(out_dir: &'a Path, baseline: Baseline, cancel: &'a CancellationToken) -> Self {
        Self {
            out_dir,
            baseline,
            cancel,
        }
    }

    fn write_payload(&self, tree: &Octree, node: &OctreeNode) -> Result<u64> {
        self.cancel.check()?;

        let path = self.out_dir.join(node.content_uri());
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| TilerError::export(parent, e))?;
        }

        let bytes = pnts::write_file(&path, &node_payload(tree, node, self.baseline))
            .map_err(|e| TilerError::export(&path, e))?;

        log::debug!("wrote {} ({} points)", path.display(), node.retained());
        Ok(bytes)
    }

    /// Write every payload, then the manifest. Nothing claims success
    /// unless all payloads made it to disk.
    pub fn export(&self, tree: &Octree) -> Result<ExportSummary> {
        fs::create_dir_all(self.out_dir).map_err(|e| TilerError::export(self.out_dir, e))?;

        let nodes = tree.nodes();
        let content: Vec<&OctreeNode> = nodes.iter().copied().filter(|n| n.has_content()).collect();

        let sizes = content
            .par_iter()
            .map(|node| self.write_payload(tree, node))
            .collect::<Result<Vec<u64>>>()?;

        self.cancel.check()?;
        let tileset = build_tileset(tree, self.baseline);
        let manifest = self.manifest_path();
        let json = serde_json::to_vec_pretty(&tileset)
            .map_err(|e| TilerError::export(&manifest, e.into()))?;
        fs::write(&manifest, &json).map_err(|e| TilerError::export(&manifest, e))?;

        Ok(ExportSummary {
            nodes: nodes.len(),
            payloads: sizes.len(),
            points: content.iter().map(|n| n.retained()).sum(),
            bytes: sizes.iter().sum::<u64>() + json.len() as u64,
        })
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.out_dir.join(TILESET_FILE)
    }
}
