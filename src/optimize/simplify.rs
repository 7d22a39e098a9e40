//! Vertex welding and triangle-count reduction.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::document::{Document, Primitive};
use crate::foundation::error::{MeshpressError, MeshpressResult};

/// Options for the simplify transform.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SimplifyOptions {
    /// Target triangle ratio in `(0, 1]`. `1.0` welds without decimating.
    pub ratio: f32,
    /// Positional weld tolerance, `>= 0`.
    pub error: f32,
}

impl Default for SimplifyOptions {
    fn default() -> Self {
        Self {
            ratio: 0.5,
            error: 0.001,
        }
    }
}

pub(crate) fn simplify(doc: &mut Document, opts: &SimplifyOptions) -> MeshpressResult<()> {
    if !opts.ratio.is_finite() || opts.ratio <= 0.0 || opts.ratio > 1.0 {
        return Err(MeshpressError::validation(
            "simplify ratio must be in (0, 1]",
        ));
    }
    if !opts.error.is_finite() || opts.error < 0.0 {
        return Err(MeshpressError::validation(
            "simplify error tolerance must be >= 0",
        ));
    }

    for mesh in &mut doc.meshes {
        for primitive in &mut mesh.primitives {
            weld(primitive, opts.error)?;
            if opts.ratio < 1.0 {
                decimate(primitive, opts.ratio)?;
            }
        }
    }
    Ok(())
}

/// Merge vertices that fall into the same tolerance cell, keeping the first
/// occupant's attributes, then drop degenerate triangles.
fn weld(primitive: &mut Primitive, tolerance: f32) -> MeshpressResult<()> {
    let vertex_count = primitive.positions.len();
    if vertex_count == 0 {
        return Ok(());
    }
    check_attribute_lengths(primitive)?;

    let cell = if tolerance > 0.0 { tolerance } else { f32::MIN_POSITIVE };
    let mut cells: HashMap<[i64; 3], u32> = HashMap::with_capacity(vertex_count);
    // Old vertex index -> new vertex index.
    let mut remap = Vec::with_capacity(vertex_count);
    let mut keep = Vec::with_capacity(vertex_count);

    for (index, position) in primitive.positions.iter().enumerate() {
        let key = [
            (position[0] / cell).round() as i64,
            (position[1] / cell).round() as i64,
            (position[2] / cell).round() as i64,
        ];
        match cells.get(&key) {
            Some(&existing) => remap.push(existing),
            None => {
                let new_index = keep.len() as u32;
                cells.insert(key, new_index);
                keep.push(index);
                remap.push(new_index);
            }
        }
    }

    if keep.len() == vertex_count {
        drop_degenerates(primitive);
        return Ok(());
    }

    compact_attributes(primitive, &keep);
    for index in &mut primitive.indices {
        *index = remap[*index as usize];
    }
    drop_degenerates(primitive);
    Ok(())
}

/// Collapse shortest edges until the triangle count reaches the target
/// ratio. Attribute streams are compacted afterwards.
fn decimate(primitive: &mut Primitive, ratio: f32) -> MeshpressResult<()> {
    let original_triangles = primitive.triangle_count();
    if original_triangles == 0 {
        return Ok(());
    }
    let target = ((original_triangles as f32 * ratio).ceil() as usize).max(1);

    while primitive.triangle_count() > target {
        let before = primitive.triangle_count();
        collapse_pass(primitive, before - target);
        drop_degenerates(primitive);
        if primitive.triangle_count() >= before {
            // No collapsible edges left.
            break;
        }
    }

    // Remove vertices that no triangle references anymore.
    prune_unreferenced_vertices(primitive);
    Ok(())
}

fn collapse_pass(primitive: &mut Primitive, budget: usize) {
    let mut edges: Vec<(f32, u32, u32)> = Vec::new();
    for triangle in primitive.indices.chunks_exact(3) {
        for (a, b) in [
            (triangle[0], triangle[1]),
            (triangle[1], triangle[2]),
            (triangle[2], triangle[0]),
        ] {
            let (lo, hi) = if a < b { (a, b) } else { (b, a) };
            if lo == hi {
                continue;
            }
            let pa = primitive.positions[lo as usize];
            let pb = primitive.positions[hi as usize];
            let length = (pa[0] - pb[0]).powi(2) + (pa[1] - pb[1]).powi(2) + (pa[2] - pb[2]).powi(2);
            edges.push((length, lo, hi));
        }
    }
    edges.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)).then(a.2.cmp(&b.2)));
    edges.dedup_by(|a, b| a.1 == b.1 && a.2 == b.2);

    let mut touched = vec![false; primitive.positions.len()];
    let mut remap: Vec<u32> = (0..primitive.positions.len() as u32).collect();
    let mut collapsed = 0usize;
    for (_, lo, hi) in edges {
        if collapsed >= budget {
            break;
        }
        if touched[lo as usize] || touched[hi as usize] {
            continue;
        }
        // Merge hi into lo.
        remap[hi as usize] = lo;
        touched[lo as usize] = true;
        touched[hi as usize] = true;
        collapsed += 1;
    }
    if collapsed == 0 {
        return;
    }

    for index in &mut primitive.indices {
        *index = remap[*index as usize];
    }
}

fn drop_degenerates(primitive: &mut Primitive) {
    let mut kept = Vec::with_capacity(primitive.indices.len());
    for triangle in primitive.indices.chunks_exact(3) {
        if triangle[0] != triangle[1] && triangle[1] != triangle[2] && triangle[0] != triangle[2] {
            kept.extend_from_slice(triangle);
        }
    }
    primitive.indices = kept;
}

fn prune_unreferenced_vertices(primitive: &mut Primitive) {
    let vertex_count = primitive.positions.len();
    let mut used = vec![false; vertex_count];
    for &index in &primitive.indices {
        used[index as usize] = true;
    }
    if used.iter().all(|&u| u) {
        return;
    }

    let mut remap = vec![u32::MAX; vertex_count];
    let mut keep = Vec::new();
    for (index, &is_used) in used.iter().enumerate() {
        if is_used {
            remap[index] = keep.len() as u32;
            keep.push(index);
        }
    }
    compact_attributes(primitive, &keep);
    for index in &mut primitive.indices {
        *index = remap[*index as usize];
    }
}

fn compact_attributes(primitive: &mut Primitive, keep: &[usize]) {
    let positions = std::mem::take(&mut primitive.positions);
    primitive.positions = keep.iter().map(|&i| positions[i]).collect();
    if let Some(normals) = primitive.normals.take() {
        primitive.normals = Some(keep.iter().map(|&i| normals[i]).collect());
    }
    if let Some(tex_coords) = primitive.tex_coords.take() {
        primitive.tex_coords = Some(keep.iter().map(|&i| tex_coords[i]).collect());
    }
    if let Some(colors) = primitive.colors.take() {
        primitive.colors = Some(keep.iter().map(|&i| colors[i]).collect());
    }
}

fn check_attribute_lengths(primitive: &Primitive) -> MeshpressResult<()> {
    let vertex_count = primitive.positions.len();
    let consistent = primitive.normals.as_ref().is_none_or(|n| n.len() == vertex_count)
        && primitive.tex_coords.as_ref().is_none_or(|t| t.len() == vertex_count)
        && primitive.colors.as_ref().is_none_or(|c| c.len() == vertex_count);
    if !consistent {
        return Err(MeshpressError::transform(
            "primitive attribute streams have mismatched vertex counts",
        ));
    }
    for &index in &primitive.indices {
        if index as usize >= vertex_count {
            return Err(MeshpressError::transform(format!(
                "index {index} out of range for {vertex_count} vertices"
            )));
        }
    }
    Ok(())
}
