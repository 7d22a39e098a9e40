//! Bit-depth reduction of vertex attribute storage.
//!
//! Positions are rescaled into normalized range with the dequantization
//! transform baked into every node that references the mesh
//! (`KHR_mesh_quantization` style). Normals, texture coordinates and colors
//! quantize in place since their domains are already normalized.

use serde::{Deserialize, Serialize};

use crate::document::{ComponentStorage, Document, Mesh};
use crate::foundation::error::{MeshpressError, MeshpressResult};

/// Target bit depths per attribute class.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct QuantizeOptions {
    pub position_bits: u8,
    pub normal_bits: u8,
    pub color_bits: u8,
    pub tex_coord_bits: u8,
}

impl Default for QuantizeOptions {
    fn default() -> Self {
        Self {
            position_bits: 14,
            normal_bits: 10,
            color_bits: 8,
            tex_coord_bits: 12,
        }
    }
}

/// Physical storage for a requested bit depth. More than 16 bits keeps f32.
fn unsigned_storage(bits: u8) -> ComponentStorage {
    match bits {
        0..=8 => ComponentStorage::U8Norm,
        9..=16 => ComponentStorage::U16Norm,
        _ => ComponentStorage::F32,
    }
}

fn signed_storage(bits: u8) -> ComponentStorage {
    match bits {
        0..=8 => ComponentStorage::I8Norm,
        9..=16 => ComponentStorage::I16Norm,
        _ => ComponentStorage::F32,
    }
}

pub(crate) fn quantize(doc: &mut Document, opts: &QuantizeOptions) -> MeshpressResult<()> {
    let bits_valid = [
        opts.position_bits,
        opts.normal_bits,
        opts.color_bits,
        opts.tex_coord_bits,
    ]
    .iter()
    .all(|&bits| bits >= 1);
    if !bits_valid {
        return Err(MeshpressError::validation(
            "quantization bit depths must be >= 1",
        ));
    }

    for mesh_index in 0..doc.meshes.len() {
        let referencing_nodes = doc.nodes_referencing_mesh(mesh_index);
        quantize_mesh(doc, mesh_index, &referencing_nodes, opts);
    }
    Ok(())
}

fn quantize_mesh(
    doc: &mut Document,
    mesh_index: usize,
    referencing_nodes: &[usize],
    opts: &QuantizeOptions,
) {
    // Positions need a node to carry the dequantization transform; a mesh
    // referenced by no node keeps f32 positions.
    let position_storage = unsigned_storage(opts.position_bits);
    if position_storage.is_normalized() && !referencing_nodes.is_empty() {
        if let Some((min, extent)) = mesh_bounds(&doc.meshes[mesh_index]) {
            quantize_positions(
                &mut doc.meshes[mesh_index],
                min,
                extent,
                opts.position_bits,
                position_storage,
            );
            bake_dequantization(doc, referencing_nodes, min, extent);
        }
    }

    let mesh = &mut doc.meshes[mesh_index];
    for primitive in &mut mesh.primitives {
        if let Some(normals) = &mut primitive.normals {
            let storage = signed_storage(opts.normal_bits);
            if storage.is_normalized() {
                let grid = grid_size(opts.normal_bits, true);
                for normal in normals.iter_mut() {
                    for component in normal.iter_mut() {
                        *component = snap(*component, -1.0, 1.0, grid);
                    }
                }
                primitive.storage.normal = storage;
            }
        }

        if let Some(tex_coords) = &mut primitive.tex_coords {
            let storage = unsigned_storage(opts.tex_coord_bits);
            // Coordinates outside [0, 1] (wrapping) cannot be stored
            // normalized; leave those primitives at f32.
            let in_range = tex_coords
                .iter()
                .all(|uv| uv.iter().all(|&v| (0.0..=1.0).contains(&v)));
            if storage.is_normalized() && in_range {
                let grid = grid_size(opts.tex_coord_bits, false);
                for tex_coord in tex_coords.iter_mut() {
                    for component in tex_coord.iter_mut() {
                        *component = snap(*component, 0.0, 1.0, grid);
                    }
                }
                primitive.storage.tex_coord = storage;
            }
        }

        if let Some(colors) = &mut primitive.colors {
            let storage = unsigned_storage(opts.color_bits);
            if storage.is_normalized() {
                let grid = grid_size(opts.color_bits, false);
                for color in colors.iter_mut() {
                    for component in color.iter_mut() {
                        *component = snap(*component, 0.0, 1.0, grid);
                    }
                }
                primitive.storage.color = storage;
            }
        }
    }
}

/// Min and extent of all primitive positions in a mesh, if it has any.
fn mesh_bounds(mesh: &Mesh) -> Option<([f32; 3], [f32; 3])> {
    let mut min = [f32::INFINITY; 3];
    let mut max = [f32::NEG_INFINITY; 3];
    let mut any = false;
    for primitive in &mesh.primitives {
        if primitive.storage.position.is_normalized() {
            // Already quantized; re-quantizing would stack node bakes.
            return None;
        }
        for position in &primitive.positions {
            any = true;
            for axis in 0..3 {
                min[axis] = min[axis].min(position[axis]);
                max[axis] = max[axis].max(position[axis]);
            }
        }
    }
    if !any {
        return None;
    }
    let extent = [
        (max[0] - min[0]).max(f32::MIN_POSITIVE),
        (max[1] - min[1]).max(f32::MIN_POSITIVE),
        (max[2] - min[2]).max(f32::MIN_POSITIVE),
    ];
    Some((min, extent))
}

fn quantize_positions(
    mesh: &mut Mesh,
    min: [f32; 3],
    extent: [f32; 3],
    bits: u8,
    storage: ComponentStorage,
) {
    let grid = grid_size(bits, false);
    for primitive in &mut mesh.primitives {
        for position in &mut primitive.positions {
            for axis in 0..3 {
                let normalized = (position[axis] - min[axis]) / extent[axis];
                position[axis] = snap(normalized, 0.0, 1.0, grid);
            }
        }
        primitive.storage.position = storage;
    }
}

/// Fold the dequantization (scale by extent, offset by min) into each node
/// that references the mesh: `T' = T + R·(S∘min)`, `S' = S∘extent`.
fn bake_dequantization(doc: &mut Document, nodes: &[usize], min: [f32; 3], extent: [f32; 3]) {
    for &node_index in nodes {
        let node = &mut doc.nodes[node_index];
        let scaled_min = [
            node.scale[0] * min[0],
            node.scale[1] * min[1],
            node.scale[2] * min[2],
        ];
        let rotated = rotate(node.rotation, scaled_min);
        for axis in 0..3 {
            node.translation[axis] += rotated[axis];
            node.scale[axis] *= extent[axis];
        }
    }
}

/// Rotate a vector by a unit quaternion `[x, y, z, w]`.
fn rotate(q: [f32; 4], v: [f32; 3]) -> [f32; 3] {
    let qv = [q[0], q[1], q[2]];
    let t = scale3(cross(qv, v), 2.0);
    add3(add3(v, scale3(t, q[3])), cross(qv, t))
}

fn cross(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

fn scale3(v: [f32; 3], s: f32) -> [f32; 3] {
    [v[0] * s, v[1] * s, v[2] * s]
}

fn add3(a: [f32; 3], b: [f32; 3]) -> [f32; 3] {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

fn grid_size(bits: u8, signed: bool) -> f32 {
    let bits = bits.min(16) as u32;
    if signed {
        ((1u32 << (bits - 1)) - 1).max(1) as f32
    } else {
        ((1u32 << bits) - 1).max(1) as f32
    }
}

/// Snap a value onto the quantization grid inside `[lo, hi]`.
fn snap(value: f32, lo: f32, hi: f32, grid: f32) -> f32 {
    (value.clamp(lo, hi) * grid).round() / grid
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{Mesh, Node, Primitive};

    fn doc_with_mesh() -> Document {
        Document {
            nodes: vec![Node {
                mesh: Some(0),
                ..Node::default()
            }],
            meshes: vec![Mesh {
                name: None,
                primitives: vec![Primitive {
                    positions: vec![[-2.0, 0.0, 0.0], [2.0, 0.0, 0.0], [0.0, 4.0, 0.0]],
                    normals: Some(vec![[0.0, 0.0, 1.0]; 3]),
                    tex_coords: Some(vec![[0.0, 0.0], [1.0, 0.0], [0.5, 1.0]]),
                    indices: vec![0, 1, 2],
                    ..Primitive::default()
                }],
            }],
            ..Document::default()
        }
    }

    #[test]
    fn default_bits_pick_16_and_8_bit_storage() {
        let mut doc = doc_with_mesh();
        quantize(&mut doc, &QuantizeOptions::default()).expect("quantize");
        let storage = doc.meshes[0].primitives[0].storage;
        assert_eq!(storage.position, ComponentStorage::U16Norm);
        assert_eq!(storage.normal, ComponentStorage::I16Norm);
        assert_eq!(storage.tex_coord, ComponentStorage::U16Norm);
    }

    #[test]
    fn positions_are_rescaled_into_unit_range_with_node_bake() {
        let mut doc = doc_with_mesh();
        quantize(&mut doc, &QuantizeOptions::default()).expect("quantize");

        for position in &doc.meshes[0].primitives[0].positions {
            for &component in position {
                assert!((0.0..=1.0).contains(&component));
            }
        }
        // min = [-2, 0, 0], extent = [4, 4, eps]; identity node picks both up.
        assert_eq!(doc.nodes[0].translation[0], -2.0);
        assert_eq!(doc.nodes[0].scale[0], 4.0);
        assert_eq!(doc.nodes[0].scale[1], 4.0);
    }

    #[test]
    fn unreferenced_mesh_keeps_f32_positions() {
        let mut doc = doc_with_mesh();
        doc.nodes.clear();
        quantize(&mut doc, &QuantizeOptions::default()).expect("quantize");
        assert_eq!(
            doc.meshes[0].primitives[0].storage.position,
            ComponentStorage::F32
        );
        // Normals still quantize; they need no node bake.
        assert_eq!(
            doc.meshes[0].primitives[0].storage.normal,
            ComponentStorage::I16Norm
        );
    }

    #[test]
    fn wrapping_tex_coords_stay_f32() {
        let mut doc = doc_with_mesh();
        doc.meshes[0].primitives[0].tex_coords = Some(vec![[0.0, 0.0], [2.5, 0.0], [0.5, 1.0]]);
        quantize(&mut doc, &QuantizeOptions::default()).expect("quantize");
        assert_eq!(
            doc.meshes[0].primitives[0].storage.tex_coord,
            ComponentStorage::F32
        );
    }

    #[test]
    fn quantize_is_idempotent_on_positions() {
        let mut doc = doc_with_mesh();
        quantize(&mut doc, &QuantizeOptions::default()).expect("quantize");
        let translation = doc.nodes[0].translation;
        let scale = doc.nodes[0].scale;
        quantize(&mut doc, &QuantizeOptions::default()).expect("second quantize");
        // Second pass must not stack another node bake.
        assert_eq!(doc.nodes[0].translation, translation);
        assert_eq!(doc.nodes[0].scale, scale);
    }

    #[test]
    fn zero_bits_rejected() {
        let mut doc = doc_with_mesh();
        let err = quantize(
            &mut doc,
            &QuantizeOptions {
                position_bits: 0,
                ..QuantizeOptions::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, MeshpressError::Validation(_)));
    }
}
