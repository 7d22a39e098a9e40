//! Smooth vertex normal recomputation.

use serde::{Deserialize, Serialize};

use crate::document::{ComponentStorage, Document, Primitive};
use crate::foundation::error::{MeshpressError, MeshpressResult};

/// Options for the normal-optimization transform.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct NormalsOptions {
    /// Replace existing normals. When `false`, only primitives missing
    /// normals gain them.
    pub overwrite: bool,
}

pub(crate) fn optimize_normals(doc: &mut Document, opts: &NormalsOptions) -> MeshpressResult<()> {
    for mesh in &mut doc.meshes {
        for primitive in &mut mesh.primitives {
            if primitive.normals.is_some() && !opts.overwrite {
                continue;
            }
            primitive.normals = Some(compute_normals(primitive)?);
            // Freshly computed normals are full-precision again.
            primitive.storage.normal = ComponentStorage::F32;
        }
    }
    Ok(())
}

/// Area-weighted smooth normals: unnormalized face cross products
/// accumulate per vertex, then normalize.
fn compute_normals(primitive: &Primitive) -> MeshpressResult<Vec<[f32; 3]>> {
    let vertex_count = primitive.positions.len();
    let mut accumulated = vec![[0.0f32; 3]; vertex_count];

    for triangle in primitive.indices.chunks_exact(3) {
        let [a, b, c] = [triangle[0] as usize, triangle[1] as usize, triangle[2] as usize];
        if a >= vertex_count || b >= vertex_count || c >= vertex_count {
            return Err(MeshpressError::transform(
                "triangle index out of range while computing normals",
            ));
        }
        let pa = primitive.positions[a];
        let pb = primitive.positions[b];
        let pc = primitive.positions[c];
        let u = [pb[0] - pa[0], pb[1] - pa[1], pb[2] - pa[2]];
        let v = [pc[0] - pa[0], pc[1] - pa[1], pc[2] - pa[2]];
        let face = [
            u[1] * v[2] - u[2] * v[1],
            u[2] * v[0] - u[0] * v[2],
            u[0] * v[1] - u[1] * v[0],
        ];
        for &vertex in &[a, b, c] {
            for axis in 0..3 {
                accumulated[vertex][axis] += face[axis];
            }
        }
    }

    Ok(accumulated
        .into_iter()
        .map(|normal| {
            let length =
                (normal[0] * normal[0] + normal[1] * normal[1] + normal[2] * normal[2]).sqrt();
            if length > 0.0 {
                [normal[0] / length, normal[1] / length, normal[2] / length]
            } else {
                [0.0, 0.0, 1.0]
            }
        })
        .collect())
}
