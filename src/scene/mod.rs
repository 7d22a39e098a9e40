//! Renderer-side scene graph accepted as a load input.
//!
//! A [`SceneGraph`] is the boundary shape a live viewer hands over: an
//! owned node tree with decoded meshes and materials. Encoding flattens it
//! into an indexed [`Document`] so transforms and exporters can run.

use serde::{Deserialize, Serialize};

use crate::document::{
    Document, Material, Mesh, Node, Primitive, Scene, Texture, mime_for_name,
};
use crate::foundation::error::{MeshpressError, MeshpressResult};

/// Decoded image carried by a scene material.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneTexture {
    pub name: Option<String>,
    pub mime_type: Option<String>,
    pub image: Vec<u8>,
}

/// Material on a scene mesh, PBR metallic-roughness subset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneMaterial {
    pub name: Option<String>,
    pub base_color: [f32; 4],
    pub metallic: f32,
    pub roughness: f32,
    pub base_color_texture: Option<SceneTexture>,
}

impl Default for SceneMaterial {
    fn default() -> Self {
        Self {
            name: None,
            base_color: [1.0; 4],
            metallic: 1.0,
            roughness: 1.0,
            base_color_texture: None,
        }
    }
}

/// Triangle mesh attached to a scene node.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneMesh {
    pub name: Option<String>,
    pub positions: Vec<[f32; 3]>,
    pub normals: Option<Vec<[f32; 3]>>,
    pub tex_coords: Option<Vec<[f32; 2]>>,
    /// Empty means non-indexed; vertices triangulate in order.
    pub indices: Vec<u32>,
    pub material: Option<SceneMaterial>,
}

/// One node in the scene tree, owning its children.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SceneNode {
    pub name: Option<String>,
    pub translation: [f32; 3],
    /// Unit quaternion `[x, y, z, w]`.
    pub rotation: [f32; 4],
    pub scale: [f32; 3],
    pub mesh: Option<SceneMesh>,
    pub children: Vec<SceneNode>,
}

impl Default for SceneNode {
    fn default() -> Self {
        Self {
            name: None,
            translation: [0.0; 3],
            rotation: [0.0, 0.0, 0.0, 1.0],
            scale: [1.0; 3],
            mesh: None,
            children: Vec::new(),
        }
    }
}

/// A live scene graph: the root set of an owned node tree.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct SceneGraph {
    pub name: Option<String>,
    pub roots: Vec<SceneNode>,
}

/// Flatten a scene graph into an indexed document.
pub(crate) fn scene_to_document(scene: &SceneGraph) -> MeshpressResult<Document> {
    let mut doc = Document::default();
    let mut root_indices = Vec::with_capacity(scene.roots.len());
    for root in &scene.roots {
        root_indices.push(flatten_node(root, &mut doc)?);
    }
    doc.scenes.push(Scene {
        name: scene.name.clone(),
        nodes: root_indices,
    });
    doc.default_scene = Some(0);
    Ok(doc)
}

fn flatten_node(node: &SceneNode, doc: &mut Document) -> MeshpressResult<usize> {
    let mesh = match &node.mesh {
        Some(scene_mesh) => Some(encode_mesh(scene_mesh, doc)?),
        None => None,
    };

    let node_index = doc.nodes.len();
    doc.nodes.push(Node {
        name: node.name.clone(),
        translation: node.translation,
        rotation: node.rotation,
        scale: node.scale,
        mesh,
        children: Vec::new(),
    });

    for child in &node.children {
        let child_index = flatten_node(child, doc)?;
        doc.nodes[node_index].children.push(child_index);
    }
    Ok(node_index)
}

fn encode_mesh(scene_mesh: &SceneMesh, doc: &mut Document) -> MeshpressResult<usize> {
    if scene_mesh.positions.is_empty() {
        return Err(MeshpressError::format(
            "scene mesh has no vertex positions",
        ));
    }
    let vertex_count = scene_mesh.positions.len();
    let indices = if scene_mesh.indices.is_empty() {
        (0..vertex_count as u32).collect()
    } else {
        for &index in &scene_mesh.indices {
            if index as usize >= vertex_count {
                return Err(MeshpressError::format(format!(
                    "scene mesh index {index} out of range for {vertex_count} vertices"
                )));
            }
        }
        scene_mesh.indices.clone()
    };

    let material = match &scene_mesh.material {
        Some(scene_material) => Some(encode_material(scene_material, doc)),
        None => None,
    };

    let mesh_index = doc.meshes.len();
    doc.meshes.push(Mesh {
        name: scene_mesh.name.clone(),
        primitives: vec![Primitive {
            positions: scene_mesh.positions.clone(),
            normals: scene_mesh.normals.clone(),
            tex_coords: scene_mesh.tex_coords.clone(),
            colors: None,
            indices,
            material,
            storage: Default::default(),
        }],
    });
    Ok(mesh_index)
}

fn encode_material(scene_material: &SceneMaterial, doc: &mut Document) -> usize {
    let base_color_texture = scene_material.base_color_texture.as_ref().map(|texture| {
        let texture_index = doc.textures.len();
        let mime_type = texture.mime_type.clone().unwrap_or_else(|| {
            texture
                .name
                .as_deref()
                .map(mime_for_name)
                .unwrap_or_else(|| "image/png".to_owned())
        });
        doc.textures.push(Texture {
            name: texture.name.clone(),
            mime_type,
            image: texture.image.clone(),
            sampler: None,
        });
        texture_index
    });

    let material_index = doc.materials.len();
    doc.materials.push(Material {
        name: scene_material.name.clone(),
        base_color_factor: scene_material.base_color,
        metallic_factor: scene_material.metallic,
        roughness_factor: scene_material.roughness,
        base_color_texture,
        ..Material::default()
    });
    material_index
}
