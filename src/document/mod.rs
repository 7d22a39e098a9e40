//! In-memory scene-description document.
//!
//! A [`Document`] is the fully decoded form of a glTF/GLB asset: nodes,
//! meshes, materials and textures with geometry held as plain vertex
//! streams. Transforms mutate this form; [`codec`] moves it to and from the
//! binary (GLB) and JSON (glTF) serializations.

use serde::{Deserialize, Serialize};

pub mod codec;
pub(crate) mod schema;

/// Component type an attribute stream re-encodes with.
///
/// Reads record the storage found in the source so an untouched document
/// round-trips at the same byte size; the quantize transform narrows it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentStorage {
    /// 32-bit IEEE float.
    #[default]
    F32,
    /// Unsigned 16-bit, normalized to `[0, 1]`.
    U16Norm,
    /// Signed 16-bit, normalized to `[-1, 1]`.
    I16Norm,
    /// Unsigned 8-bit, normalized to `[0, 1]`.
    U8Norm,
    /// Signed 8-bit, normalized to `[-1, 1]`.
    I8Norm,
}

impl ComponentStorage {
    /// Byte width of one component.
    pub fn byte_size(self) -> usize {
        match self {
            Self::F32 => 4,
            Self::U16Norm | Self::I16Norm => 2,
            Self::U8Norm | Self::I8Norm => 1,
        }
    }

    /// Whether values are stored as normalized integers.
    pub fn is_normalized(self) -> bool {
        !matches!(self, Self::F32)
    }
}

/// Per-attribute-class storage for one primitive.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttributeStorage {
    pub position: ComponentStorage,
    pub normal: ComponentStorage,
    pub tex_coord: ComponentStorage,
    pub color: ComponentStorage,
}

/// One triangle-mode primitive: vertex streams plus a u32 index list.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Primitive {
    pub positions: Vec<[f32; 3]>,
    pub normals: Option<Vec<[f32; 3]>>,
    pub tex_coords: Option<Vec<[f32; 2]>>,
    pub colors: Option<Vec<[f32; 4]>>,
    pub indices: Vec<u32>,
    pub material: Option<usize>,
    pub storage: AttributeStorage,
}

impl Primitive {
    /// Number of vertices in this primitive.
    pub fn vertex_count(&self) -> usize {
        self.positions.len()
    }

    /// Number of triangles in this primitive.
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Mesh {
    pub name: Option<String>,
    pub primitives: Vec<Primitive>,
}

/// Scene-graph node with a decomposed TRS transform.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub name: Option<String>,
    pub translation: [f32; 3],
    /// Unit quaternion `[x, y, z, w]`.
    pub rotation: [f32; 4],
    pub scale: [f32; 3],
    pub mesh: Option<usize>,
    pub children: Vec<usize>,
}

impl Default for Node {
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

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub name: Option<String>,
    pub nodes: Vec<usize>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlphaMode {
    #[default]
    Opaque,
    Mask,
    Blend,
}

/// PBR metallic-roughness material subset.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Material {
    pub name: Option<String>,
    pub base_color_factor: [f32; 4],
    pub metallic_factor: f32,
    pub roughness_factor: f32,
    pub emissive_factor: [f32; 3],
    pub base_color_texture: Option<usize>,
    pub metallic_roughness_texture: Option<usize>,
    pub normal_texture: Option<usize>,
    pub occlusion_texture: Option<usize>,
    pub emissive_texture: Option<usize>,
    pub alpha_mode: AlphaMode,
    pub alpha_cutoff: Option<f32>,
    pub double_sided: bool,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: None,
            base_color_factor: [1.0; 4],
            metallic_factor: 1.0,
            roughness_factor: 1.0,
            emissive_factor: [0.0; 3],
            base_color_texture: None,
            metallic_roughness_texture: None,
            normal_texture: None,
            occlusion_texture: None,
            emissive_texture: None,
            alpha_mode: AlphaMode::Opaque,
            alpha_cutoff: None,
            double_sided: false,
        }
    }
}

impl Material {
    /// Texture indices this material references, in slot order.
    pub fn texture_refs(&self) -> impl Iterator<Item = usize> + '_ {
        [
            self.base_color_texture,
            self.metallic_roughness_texture,
            self.normal_texture,
            self.occlusion_texture,
            self.emissive_texture,
        ]
        .into_iter()
        .flatten()
    }

    pub(crate) fn texture_refs_mut(&mut self) -> [&mut Option<usize>; 5] {
        [
            &mut self.base_color_texture,
            &mut self.metallic_roughness_texture,
            &mut self.normal_texture,
            &mut self.occlusion_texture,
            &mut self.emissive_texture,
        ]
    }
}

/// Sampler settings carried through from the source document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SamplerDesc {
    pub mag_filter: Option<u32>,
    pub min_filter: Option<u32>,
    pub wrap_s: Option<u32>,
    pub wrap_t: Option<u32>,
}

/// A texture: encoded image bytes plus MIME type.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Texture {
    pub name: Option<String>,
    pub mime_type: String,
    pub image: Vec<u8>,
    pub sampler: Option<SamplerDesc>,
}

/// Read-only view into a document's texture at a stable index.
///
/// Indices stay stable until a structural transform reorders resources;
/// re-fetch descriptors after such a transform.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextureDescriptor {
    pub index: usize,
    pub name: String,
    pub mime_type: String,
    pub byte_length: usize,
}

/// Extracted raw bytes for one texture. Used only by the offload protocol;
/// never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TexturePayload {
    pub index: usize,
    pub name: String,
    pub mime_type: String,
    pub image: Vec<u8>,
}

/// Structural counts summed from a full inspection of the document.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentStats {
    pub vertices: u64,
    pub triangles: u64,
    pub materials: usize,
    pub textures: usize,
    pub meshes: usize,
}

/// The in-memory scene-description graph.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub generator: Option<String>,
    pub scenes: Vec<Scene>,
    pub default_scene: Option<usize>,
    pub nodes: Vec<Node>,
    pub meshes: Vec<Mesh>,
    pub materials: Vec<Material>,
    pub textures: Vec<Texture>,
    /// When set, the binary writer shares identical attribute streams in a
    /// single buffer view. Set by reading a document that already shares
    /// accessors, or by the deduplicate transform.
    pub shared_accessors: bool,
}

impl Document {
    /// Sum structural counts from the current document state.
    ///
    /// Counts are computed fresh on every call, never tracked incrementally,
    /// so they stay correct regardless of how many transforms ran or
    /// reverted.
    pub fn stats(&self) -> DocumentStats {
        let mut vertices = 0u64;
        let mut triangles = 0u64;
        for mesh in &self.meshes {
            for primitive in &mesh.primitives {
                vertices += primitive.vertex_count() as u64;
                triangles += primitive.triangle_count() as u64;
            }
        }
        DocumentStats {
            vertices,
            triangles,
            materials: self.materials.len(),
            textures: self.textures.len(),
            meshes: self.meshes.len(),
        }
    }

    /// Read-only descriptors for every texture, in index order.
    pub fn texture_descriptors(&self) -> Vec<TextureDescriptor> {
        self.textures
            .iter()
            .enumerate()
            .map(|(index, texture)| TextureDescriptor {
                index,
                name: texture_display_name(texture, index),
                mime_type: texture.mime_type.clone(),
                byte_length: texture.image.len(),
            })
            .collect()
    }

    /// Extract raw payloads for the offload protocol.
    pub fn texture_payloads(&self) -> Vec<TexturePayload> {
        self.textures
            .iter()
            .enumerate()
            .map(|(index, texture)| TexturePayload {
                index,
                name: texture_display_name(texture, index),
                mime_type: texture.mime_type.clone(),
                image: texture.image.clone(),
            })
            .collect()
    }

    /// Node indices that reference the given mesh.
    pub(crate) fn nodes_referencing_mesh(&self, mesh: usize) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, node)| node.mesh == Some(mesh))
            .map(|(index, _)| index)
            .collect()
    }
}

pub(crate) fn texture_display_name(texture: &Texture, index: usize) -> String {
    texture
        .name
        .clone()
        .unwrap_or_else(|| format!("texture{index}"))
}

/// File extension for a known image MIME type.
pub(crate) fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/webp" => "webp",
        "image/ktx2" => "ktx2",
        _ => "bin",
    }
}

/// Guess a MIME type from a file name.
pub(crate) fn mime_for_name(name: &str) -> String {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".png") {
        "image/png".to_owned()
    } else if lower.ends_with(".jpg") || lower.ends_with(".jpeg") {
        "image/jpeg".to_owned()
    } else if lower.ends_with(".webp") {
        "image/webp".to_owned()
    } else if lower.ends_with(".ktx2") {
        "image/ktx2".to_owned()
    } else {
        "application/octet-stream".to_owned()
    }
}
