//! Binary (GLB) and JSON (glTF) serializations of a [`Document`].
//!
//! Reads validate the container before any parse; writes are deterministic,
//! so an untouched document re-serializes at a stable byte size.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::document::schema::{
    self, GltfAccessor, GltfAsset, GltfBuffer, GltfBufferView, GltfImage, GltfMaterial, GltfMesh,
    GltfNode, GltfPbrMetallicRoughness, GltfPrimitive, GltfRoot, GltfSampler, GltfScene,
    GltfTexture, GltfTextureRef,
};
use crate::document::{
    AlphaMode, AttributeStorage, ComponentStorage, Document, Material, Mesh, Node, Primitive,
    SamplerDesc, Scene, Texture, extension_for_mime, mime_for_name, texture_display_name,
};
use crate::foundation::error::{MeshpressError, MeshpressResult};

pub(crate) const GLB_MAGIC: u32 = 0x4654_6C67; // "glTF" little-endian
pub(crate) const GLB_VERSION: u32 = 2;
pub(crate) const GLB_CHUNK_JSON: u32 = 0x4E4F_534A; // "JSON"
pub(crate) const GLB_CHUNK_BIN: u32 = 0x004E_4942; // "BIN\0"

/// Resolves a non-`data:` URI to its bytes.
///
/// The codec never touches the network; external references come from a
/// directory on disk or an in-memory name→bytes map.
pub trait ResourceResolver {
    fn resolve(&self, uri: &str) -> Option<Vec<u8>>;
}

/// Resolves URIs relative to a directory on disk.
pub struct DirResolver {
    base: PathBuf,
}

impl DirResolver {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }
}

impl ResourceResolver for DirResolver {
    fn resolve(&self, uri: &str) -> Option<Vec<u8>> {
        std::fs::read(self.base.join(uri)).ok()
    }
}

/// Resolves URIs against an in-memory map, by exact name first and basename
/// second. The basename fallback is the join key between a document and its
/// externalized assets.
pub struct MapResolver {
    entries: BTreeMap<String, Vec<u8>>,
}

impl MapResolver {
    pub fn new(entries: BTreeMap<String, Vec<u8>>) -> Self {
        Self { entries }
    }
}

impl ResourceResolver for MapResolver {
    fn resolve(&self, uri: &str) -> Option<Vec<u8>> {
        if let Some(bytes) = self.entries.get(uri) {
            return Some(bytes.clone());
        }
        let wanted = basename(uri);
        self.entries
            .iter()
            .find(|(key, _)| basename(key) == wanted)
            .map(|(_, bytes)| bytes.clone())
    }
}

/// Resolver for self-contained documents; any external reference fails.
pub struct NoResolver;

impl ResourceResolver for NoResolver {
    fn resolve(&self, _uri: &str) -> Option<Vec<u8>> {
        None
    }
}

fn basename(uri: &str) -> &str {
    uri.rsplit(['/', '\\']).next().unwrap_or(uri)
}

/// Read a GLB binary into a [`Document`].
pub fn read_binary(data: &[u8]) -> MeshpressResult<Document> {
    if data.len() < 12 {
        return Err(MeshpressError::format(format!(
            "file too small for GLB header ({} bytes)",
            data.len()
        )));
    }

    let magic = read_u32_le(&data[0..4]);
    if magic != GLB_MAGIC {
        return Err(MeshpressError::format(format!(
            "invalid GLB magic: expected {GLB_MAGIC:#010x} (\"glTF\"), found {magic:#010x}"
        )));
    }

    let version = read_u32_le(&data[4..8]);
    if version != GLB_VERSION {
        return Err(MeshpressError::format(format!(
            "unsupported GLB version: expected {GLB_VERSION}, found {version}"
        )));
    }

    let length = read_u32_le(&data[8..12]) as usize;
    if length > data.len() {
        return Err(MeshpressError::format(
            "GLB header length extends past end of file",
        ));
    }

    let mut offset = 12;
    let mut json_chunk: Option<&[u8]> = None;
    let mut bin_chunk: Option<&[u8]> = None;
    while offset + 8 <= length {
        let chunk_length = read_u32_le(&data[offset..offset + 4]) as usize;
        let chunk_type = read_u32_le(&data[offset + 4..offset + 8]);
        offset += 8;
        if offset + chunk_length > length {
            return Err(MeshpressError::format("GLB chunk extends past end of file"));
        }
        let chunk = &data[offset..offset + chunk_length];
        offset += chunk_length;
        match chunk_type {
            GLB_CHUNK_JSON => json_chunk = Some(chunk),
            GLB_CHUNK_BIN => bin_chunk = Some(chunk),
            _ => {}
        }
    }

    let json_chunk =
        json_chunk.ok_or_else(|| MeshpressError::format("GLB file has no JSON chunk"))?;
    let root: GltfRoot = serde_json::from_slice(json_chunk)?;

    let mut buffers = Vec::with_capacity(root.buffers.len());
    for (index, buffer) in root.buffers.iter().enumerate() {
        match &buffer.uri {
            None if index == 0 => {
                let bin = bin_chunk.ok_or_else(|| {
                    MeshpressError::format("buffer 0 has no URI but GLB has no BIN chunk")
                })?;
                buffers.push(bin.to_vec());
            }
            None => {
                return Err(MeshpressError::format(format!(
                    "buffer {index} has no URI and is not buffer 0"
                )));
            }
            Some(uri) if uri.starts_with("data:") => buffers.push(decode_data_uri(uri)?),
            Some(uri) => {
                return Err(MeshpressError::format(format!(
                    "external buffer URI '{uri}' is not supported inside a GLB"
                )));
            }
        }
    }

    decode_root(root, buffers, &NoResolver)
}

/// Read a glTF JSON document, resolving external resources through
/// `resolver`.
pub fn read_json(
    json: &serde_json::Value,
    resolver: &dyn ResourceResolver,
) -> MeshpressResult<Document> {
    let root: GltfRoot = serde_json::from_value(json.clone())?;

    let mut buffers = Vec::with_capacity(root.buffers.len());
    for (index, buffer) in root.buffers.iter().enumerate() {
        let uri = buffer.uri.as_deref().ok_or_else(|| {
            MeshpressError::format(format!("buffer {index} in a JSON document must have a URI"))
        })?;
        if uri.starts_with("data:") {
            buffers.push(decode_data_uri(uri)?);
        } else {
            let bytes = resolver.resolve(uri).ok_or_else(|| {
                MeshpressError::format(format!("unresolved buffer URI '{uri}'"))
            })?;
            buffers.push(bytes);
        }
    }

    decode_root(root, buffers, resolver)
}

/// Serialize a document to GLB bytes.
pub fn write_binary(doc: &Document) -> MeshpressResult<Vec<u8>> {
    let encoded = encode_document(doc, ImagePlacement::Embedded)?;
    let json = serde_json::to_string(&encoded.root)?;
    let json_bytes = json.into_bytes();

    let json_padding = padding(json_bytes.len());
    let bin_padding = padding(encoded.binary.len());
    let mut total = 12 + 8 + json_bytes.len() + json_padding;
    if !encoded.binary.is_empty() {
        total += 8 + encoded.binary.len() + bin_padding;
    }

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(&GLB_MAGIC.to_le_bytes());
    out.extend_from_slice(&GLB_VERSION.to_le_bytes());
    out.extend_from_slice(&(total as u32).to_le_bytes());

    out.extend_from_slice(&((json_bytes.len() + json_padding) as u32).to_le_bytes());
    out.extend_from_slice(&GLB_CHUNK_JSON.to_le_bytes());
    out.extend_from_slice(&json_bytes);
    out.resize(out.len() + json_padding, b' ');

    if !encoded.binary.is_empty() {
        out.extend_from_slice(&((encoded.binary.len() + bin_padding) as u32).to_le_bytes());
        out.extend_from_slice(&GLB_CHUNK_BIN.to_le_bytes());
        out.extend_from_slice(&encoded.binary);
        out.resize(out.len() + bin_padding, 0);
    }

    Ok(out)
}

/// Serialize a document to glTF JSON plus a named resource map (binary
/// buffer and image files). The primary JSON is not part of the map.
pub fn write_json(
    doc: &Document,
) -> MeshpressResult<(serde_json::Value, BTreeMap<String, Vec<u8>>)> {
    let encoded = encode_document(doc, ImagePlacement::External)?;
    let mut resources = encoded.external_images;
    if !encoded.binary.is_empty() {
        resources.insert(BUFFER_RESOURCE_NAME.to_owned(), encoded.binary);
    }
    let json = serde_json::to_value(&encoded.root)?;
    Ok((json, resources))
}

pub(crate) const BUFFER_RESOURCE_NAME: &str = "buffer0.bin";

fn padding(len: usize) -> usize {
    (4 - (len % 4)) % 4
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

pub(crate) fn decode_data_uri(uri: &str) -> MeshpressResult<Vec<u8>> {
    let comma = uri
        .find(',')
        .ok_or_else(|| MeshpressError::format("malformed data URI: missing ','"))?;
    let (header, payload) = uri.split_at(comma);
    let payload = &payload[1..];
    if header.ends_with(";base64") {
        BASE64
            .decode(payload)
            .map_err(|e| MeshpressError::format(format!("malformed base64 data URI: {e}")))
    } else {
        Ok(payload.as_bytes().to_vec())
    }
}

fn data_uri_mime(uri: &str) -> Option<String> {
    let rest = uri.strip_prefix("data:")?;
    let end = rest.find([';', ','])?;
    let mime = &rest[..end];
    (!mime.is_empty()).then(|| mime.to_owned())
}

// ---------------------------------------------------------------------------
// Decoding
// ---------------------------------------------------------------------------

fn decode_root(
    root: GltfRoot,
    buffers: Vec<Vec<u8>>,
    resolver: &dyn ResourceResolver,
) -> MeshpressResult<Document> {
    let shared_accessors = accessors_are_shared(&root);

    let mut images = Vec::with_capacity(root.images.len());
    for (index, image) in root.images.iter().enumerate() {
        images.push(decode_image(&root, &buffers, resolver, image, index)?);
    }

    let mut textures = Vec::with_capacity(root.textures.len());
    for (index, texture) in root.textures.iter().enumerate() {
        let source = texture.source.ok_or_else(|| {
            MeshpressError::format(format!("texture {index} has no image source"))
        })?;
        let (mime_type, bytes, image_name) = images
            .get(source)
            .cloned()
            .ok_or_else(|| MeshpressError::format(format!("texture {index} references missing image {source}")))?;
        let sampler = texture
            .sampler
            .and_then(|s| root.samplers.get(s))
            .map(|s| SamplerDesc {
                mag_filter: s.mag_filter,
                min_filter: s.min_filter,
                wrap_s: s.wrap_s,
                wrap_t: s.wrap_t,
            });
        textures.push(Texture {
            name: texture.name.clone().or(image_name),
            mime_type,
            image: bytes,
            sampler,
        });
    }

    let materials = root.materials.iter().map(decode_material).collect();

    let mut meshes = Vec::with_capacity(root.meshes.len());
    for (mesh_index, mesh) in root.meshes.iter().enumerate() {
        let mut primitives = Vec::with_capacity(mesh.primitives.len());
        for primitive in &mesh.primitives {
            primitives.push(decode_primitive(&root, &buffers, primitive, mesh_index)?);
        }
        meshes.push(Mesh {
            name: mesh.name.clone(),
            primitives,
        });
    }

    let nodes = root
        .nodes
        .iter()
        .map(|node| {
            let (translation, rotation, scale) = match node.matrix {
                Some(matrix) => decompose_matrix(matrix),
                None => (
                    node.translation.unwrap_or([0.0; 3]),
                    node.rotation.unwrap_or([0.0, 0.0, 0.0, 1.0]),
                    node.scale.unwrap_or([1.0; 3]),
                ),
            };
            Node {
                name: node.name.clone(),
                translation,
                rotation,
                scale,
                mesh: node.mesh,
                children: node.children.clone(),
            }
        })
        .collect();

    let scenes = root
        .scenes
        .iter()
        .map(|scene| Scene {
            name: scene.name.clone(),
            nodes: scene.nodes.clone(),
        })
        .collect();

    Ok(Document {
        generator: root.asset.generator,
        scenes,
        default_scene: root.scene,
        nodes,
        meshes,
        materials,
        textures,
        shared_accessors,
    })
}

fn accessors_are_shared(root: &GltfRoot) -> bool {
    let mut seen = vec![false; root.accessors.len()];
    for mesh in &root.meshes {
        for primitive in &mesh.primitives {
            for &accessor in primitive.attributes.values().chain(primitive.indices.iter()) {
                match seen.get_mut(accessor) {
                    Some(slot) if *slot => return true,
                    Some(slot) => *slot = true,
                    None => {}
                }
            }
        }
    }
    // Sharing can also live one level down, with distinct accessors
    // pointing into one buffer view.
    let mut view_seen = vec![false; root.buffer_views.len()];
    for accessor in &root.accessors {
        if let Some(view) = accessor.buffer_view {
            match view_seen.get_mut(view) {
                Some(slot) if *slot => return true,
                Some(slot) => *slot = true,
                None => {}
            }
        }
    }
    false
}

type DecodedImage = (String, Vec<u8>, Option<String>);

fn decode_image(
    root: &GltfRoot,
    buffers: &[Vec<u8>],
    resolver: &dyn ResourceResolver,
    image: &GltfImage,
    index: usize,
) -> MeshpressResult<DecodedImage> {
    if let Some(view) = image.buffer_view {
        let bytes = buffer_view_bytes(root, buffers, view)?.to_vec();
        let mime = image
            .mime_type
            .clone()
            .unwrap_or_else(|| "application/octet-stream".to_owned());
        return Ok((mime, bytes, image.name.clone()));
    }
    let uri = image.uri.as_deref().ok_or_else(|| {
        MeshpressError::format(format!("image {index} has neither bufferView nor URI"))
    })?;
    if uri.starts_with("data:") {
        let mime = image
            .mime_type
            .clone()
            .or_else(|| data_uri_mime(uri))
            .unwrap_or_else(|| "application/octet-stream".to_owned());
        return Ok((mime, decode_data_uri(uri)?, image.name.clone()));
    }
    let bytes = resolver
        .resolve(uri)
        .ok_or_else(|| MeshpressError::format(format!("unresolved image URI '{uri}'")))?;
    let mime = image
        .mime_type
        .clone()
        .unwrap_or_else(|| mime_for_name(uri));
    let name = image
        .name
        .clone()
        .or_else(|| Some(strip_extension(basename(uri)).to_owned()));
    Ok((mime, bytes, name))
}

fn strip_extension(name: &str) -> &str {
    name.rsplit_once('.').map(|(stem, _)| stem).unwrap_or(name)
}

fn decode_material(material: &GltfMaterial) -> Material {
    let pbr = material.pbr_metallic_roughness.as_ref();
    let texture_index = |r: &Option<GltfTextureRef>| r.as_ref().map(|t| t.index);
    Material {
        name: material.name.clone(),
        base_color_factor: pbr.and_then(|p| p.base_color_factor).unwrap_or([1.0; 4]),
        metallic_factor: pbr.and_then(|p| p.metallic_factor).unwrap_or(1.0),
        roughness_factor: pbr.and_then(|p| p.roughness_factor).unwrap_or(1.0),
        emissive_factor: material.emissive_factor.unwrap_or([0.0; 3]),
        base_color_texture: pbr.and_then(|p| texture_index(&p.base_color_texture)),
        metallic_roughness_texture: pbr.and_then(|p| texture_index(&p.metallic_roughness_texture)),
        normal_texture: texture_index(&material.normal_texture),
        occlusion_texture: texture_index(&material.occlusion_texture),
        emissive_texture: texture_index(&material.emissive_texture),
        alpha_mode: match material.alpha_mode.as_deref() {
            Some("MASK") => AlphaMode::Mask,
            Some("BLEND") => AlphaMode::Blend,
            _ => AlphaMode::Opaque,
        },
        alpha_cutoff: material.alpha_cutoff,
        double_sided: material.double_sided,
    }
}

fn decode_primitive(
    root: &GltfRoot,
    buffers: &[Vec<u8>],
    primitive: &GltfPrimitive,
    mesh_index: usize,
) -> MeshpressResult<Primitive> {
    let mode = primitive.mode.unwrap_or(schema::MODE_TRIANGLES);
    if mode != schema::MODE_TRIANGLES {
        return Err(MeshpressError::format(format!(
            "mesh {mesh_index}: only triangle primitives are supported (found mode {mode})"
        )));
    }

    let position_accessor = *primitive.attributes.get("POSITION").ok_or_else(|| {
        MeshpressError::format(format!("mesh {mesh_index}: primitive has no POSITION attribute"))
    })?;

    let (positions_flat, position_storage) =
        read_accessor_f32(root, buffers, position_accessor, 3)?;
    let positions = chunk3(&positions_flat);
    let mut storage = AttributeStorage {
        position: position_storage,
        ..AttributeStorage::default()
    };

    let normals = match primitive.attributes.get("NORMAL") {
        Some(&accessor) => {
            let (flat, st) = read_accessor_f32(root, buffers, accessor, 3)?;
            storage.normal = st;
            Some(chunk3(&flat))
        }
        None => None,
    };

    let tex_coords = match primitive.attributes.get("TEXCOORD_0") {
        Some(&accessor) => {
            let (flat, st) = read_accessor_f32(root, buffers, accessor, 2)?;
            storage.tex_coord = st;
            Some(flat.chunks_exact(2).map(|c| [c[0], c[1]]).collect())
        }
        None => None,
    };

    let colors = match primitive.attributes.get("COLOR_0") {
        Some(&accessor) => {
            let components = root
                .accessors
                .get(accessor)
                .and_then(|a| schema::component_count(&a.accessor_type))
                .unwrap_or(4);
            let (flat, st) = read_accessor_f32(root, buffers, accessor, components)?;
            storage.color = st;
            let colors = if components == 3 {
                flat.chunks_exact(3).map(|c| [c[0], c[1], c[2], 1.0]).collect()
            } else {
                flat.chunks_exact(4).map(|c| [c[0], c[1], c[2], c[3]]).collect()
            };
            Some(colors)
        }
        None => None,
    };

    let indices = match primitive.indices {
        Some(accessor) => read_accessor_indices(root, buffers, accessor)?,
        None => (0..positions.len() as u32).collect(),
    };

    Ok(Primitive {
        positions,
        normals,
        tex_coords,
        colors,
        indices,
        material: primitive.material,
        storage,
    })
}

fn chunk3(flat: &[f32]) -> Vec<[f32; 3]> {
    flat.chunks_exact(3).map(|c| [c[0], c[1], c[2]]).collect()
}

fn buffer_view_bytes<'a>(
    root: &GltfRoot,
    buffers: &'a [Vec<u8>],
    view_index: usize,
) -> MeshpressResult<&'a [u8]> {
    let view = root
        .buffer_views
        .get(view_index)
        .ok_or_else(|| MeshpressError::format(format!("missing bufferView {view_index}")))?;
    let buffer = buffers
        .get(view.buffer)
        .ok_or_else(|| MeshpressError::format(format!("missing buffer {}", view.buffer)))?;
    let end = view.byte_offset + view.byte_length;
    if end > buffer.len() {
        return Err(MeshpressError::format(format!(
            "bufferView {view_index} extends past end of buffer ({end} > {})",
            buffer.len()
        )));
    }
    Ok(&buffer[view.byte_offset..end])
}

/// Decode an accessor into flat f32 components, reporting the storage it
/// was found in.
fn read_accessor_f32(
    root: &GltfRoot,
    buffers: &[Vec<u8>],
    accessor_index: usize,
    expected_components: usize,
) -> MeshpressResult<(Vec<f32>, ComponentStorage)> {
    let accessor = root
        .accessors
        .get(accessor_index)
        .ok_or_else(|| MeshpressError::format(format!("missing accessor {accessor_index}")))?;
    let components = schema::component_count(&accessor.accessor_type).ok_or_else(|| {
        MeshpressError::format(format!(
            "unsupported accessor type '{}'",
            accessor.accessor_type
        ))
    })?;
    if components != expected_components {
        return Err(MeshpressError::format(format!(
            "accessor {accessor_index}: expected {expected_components} components, found {components}"
        )));
    }

    let component_size = schema::component_byte_size(accessor.component_type).ok_or_else(|| {
        MeshpressError::format(format!(
            "unsupported component type {}",
            accessor.component_type
        ))
    })?;
    let view_index = accessor.buffer_view.ok_or_else(|| {
        MeshpressError::format(format!("accessor {accessor_index} has no bufferView"))
    })?;
    let data = buffer_view_bytes(root, buffers, view_index)?;

    let packed = components * component_size;
    let stride = root.buffer_views[view_index].byte_stride.unwrap_or(packed);
    let mut out = Vec::with_capacity(accessor.count * components);
    for element in 0..accessor.count {
        let base = accessor.byte_offset + element * stride;
        if base + packed > data.len() {
            return Err(MeshpressError::format(format!(
                "accessor {accessor_index} reads past end of bufferView"
            )));
        }
        for component in 0..components {
            let at = base + component * component_size;
            out.push(decode_component(accessor.component_type, accessor.normalized, data, at));
        }
    }

    let storage = match (accessor.component_type, accessor.normalized) {
        (schema::COMPONENT_FLOAT, _) => ComponentStorage::F32,
        (schema::COMPONENT_UNSIGNED_SHORT, true) => ComponentStorage::U16Norm,
        (schema::COMPONENT_SHORT, true) => ComponentStorage::I16Norm,
        (schema::COMPONENT_UNSIGNED_BYTE, true) => ComponentStorage::U8Norm,
        (schema::COMPONENT_BYTE, true) => ComponentStorage::I8Norm,
        _ => ComponentStorage::F32,
    };

    Ok((out, storage))
}

fn decode_component(component_type: u32, normalized: bool, data: &[u8], at: usize) -> f32 {
    match component_type {
        schema::COMPONENT_FLOAT => {
            f32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
        }
        schema::COMPONENT_UNSIGNED_BYTE => {
            let v = data[at] as f32;
            if normalized { v / 255.0 } else { v }
        }
        schema::COMPONENT_BYTE => {
            let v = data[at] as i8 as f32;
            if normalized { (v / 127.0).max(-1.0) } else { v }
        }
        schema::COMPONENT_UNSIGNED_SHORT => {
            let v = u16::from_le_bytes([data[at], data[at + 1]]) as f32;
            if normalized { v / 65535.0 } else { v }
        }
        schema::COMPONENT_SHORT => {
            let v = i16::from_le_bytes([data[at], data[at + 1]]) as f32;
            if normalized { (v / 32767.0).max(-1.0) } else { v }
        }
        schema::COMPONENT_UNSIGNED_INT => {
            u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]]) as f32
        }
        _ => 0.0,
    }
}

fn read_accessor_indices(
    root: &GltfRoot,
    buffers: &[Vec<u8>],
    accessor_index: usize,
) -> MeshpressResult<Vec<u32>> {
    let accessor = root
        .accessors
        .get(accessor_index)
        .ok_or_else(|| MeshpressError::format(format!("missing accessor {accessor_index}")))?;
    if accessor.accessor_type != "SCALAR" {
        return Err(MeshpressError::format(format!(
            "index accessor {accessor_index} must be SCALAR, found '{}'",
            accessor.accessor_type
        )));
    }
    let component_size = schema::component_byte_size(accessor.component_type).ok_or_else(|| {
        MeshpressError::format(format!(
            "unsupported component type {}",
            accessor.component_type
        ))
    })?;
    let view_index = accessor.buffer_view.ok_or_else(|| {
        MeshpressError::format(format!("accessor {accessor_index} has no bufferView"))
    })?;
    let data = buffer_view_bytes(root, buffers, view_index)?;
    let stride = root.buffer_views[view_index].byte_stride.unwrap_or(component_size);

    let mut out = Vec::with_capacity(accessor.count);
    for element in 0..accessor.count {
        let at = accessor.byte_offset + element * stride;
        if at + component_size > data.len() {
            return Err(MeshpressError::format(format!(
                "index accessor {accessor_index} reads past end of bufferView"
            )));
        }
        let value = match accessor.component_type {
            schema::COMPONENT_UNSIGNED_BYTE => data[at] as u32,
            schema::COMPONENT_UNSIGNED_SHORT => {
                u16::from_le_bytes([data[at], data[at + 1]]) as u32
            }
            schema::COMPONENT_UNSIGNED_INT => {
                u32::from_le_bytes([data[at], data[at + 1], data[at + 2], data[at + 3]])
            }
            other => {
                return Err(MeshpressError::format(format!(
                    "unsupported index component type {other}"
                )));
            }
        };
        out.push(value);
    }
    Ok(out)
}

fn decompose_matrix(m: [f32; 16]) -> ([f32; 3], [f32; 4], [f32; 3]) {
    // Column-major TRS decomposition; shear is not representable and is
    // dropped.
    let translation = [m[12], m[13], m[14]];

    let col = |i: usize| [m[4 * i], m[4 * i + 1], m[4 * i + 2]];
    let length = |v: [f32; 3]| (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt();

    let c0 = col(0);
    let c1 = col(1);
    let c2 = col(2);
    let mut sx = length(c0);
    let sy = length(c1);
    let sz = length(c2);

    let det = c0[0] * (c1[1] * c2[2] - c2[1] * c1[2])
        - c1[0] * (c0[1] * c2[2] - c2[1] * c0[2])
        + c2[0] * (c0[1] * c1[2] - c1[1] * c0[2]);
    if det < 0.0 {
        sx = -sx;
    }

    let inv = |s: f32| if s != 0.0 { 1.0 / s } else { 0.0 };
    let r = [
        [c0[0] * inv(sx), c0[1] * inv(sx), c0[2] * inv(sx)],
        [c1[0] * inv(sy), c1[1] * inv(sy), c1[2] * inv(sy)],
        [c2[0] * inv(sz), c2[1] * inv(sz), c2[2] * inv(sz)],
    ];

    // Rotation matrix (columns r[0..3]) to quaternion, trace method.
    let trace = r[0][0] + r[1][1] + r[2][2];
    let rotation = if trace > 0.0 {
        let s = (trace + 1.0).sqrt() * 2.0;
        [
            (r[1][2] - r[2][1]) / s,
            (r[2][0] - r[0][2]) / s,
            (r[0][1] - r[1][0]) / s,
            0.25 * s,
        ]
    } else if r[0][0] > r[1][1] && r[0][0] > r[2][2] {
        let s = (1.0 + r[0][0] - r[1][1] - r[2][2]).sqrt() * 2.0;
        [
            0.25 * s,
            (r[1][0] + r[0][1]) / s,
            (r[2][0] + r[0][2]) / s,
            (r[1][2] - r[2][1]) / s,
        ]
    } else if r[1][1] > r[2][2] {
        let s = (1.0 + r[1][1] - r[0][0] - r[2][2]).sqrt() * 2.0;
        [
            (r[1][0] + r[0][1]) / s,
            0.25 * s,
            (r[2][1] + r[1][2]) / s,
            (r[2][0] - r[0][2]) / s,
        ]
    } else {
        let s = (1.0 + r[2][2] - r[0][0] - r[1][1]).sqrt() * 2.0;
        [
            (r[2][0] + r[0][2]) / s,
            (r[2][1] + r[1][2]) / s,
            0.25 * s,
            (r[0][1] - r[1][0]) / s,
        ]
    };

    (translation, rotation, [sx, sy, sz])
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

enum ImagePlacement {
    /// Images live in the binary buffer (GLB).
    Embedded,
    /// Images become named external resources (glTF + asset map).
    External,
}

struct EncodedDocument {
    root: GltfRoot,
    binary: Vec<u8>,
    external_images: BTreeMap<String, Vec<u8>>,
}

struct BufferBuilder {
    binary: Vec<u8>,
    views: Vec<GltfBufferView>,
    shared: Option<HashMap<(Vec<u8>, Option<u32>), usize>>,
}

impl BufferBuilder {
    fn new(share: bool) -> Self {
        Self {
            binary: Vec::new(),
            views: Vec::new(),
            shared: share.then(HashMap::new),
        }
    }

    fn push_view(&mut self, bytes: Vec<u8>, target: Option<u32>) -> usize {
        if let Some(map) = self.shared.as_mut()
            && let Some(&existing) = map.get(&(bytes.clone(), target))
        {
            return existing;
        }
        let aligned = self.binary.len() + padding(self.binary.len());
        self.binary.resize(aligned, 0);
        let view_index = self.views.len();
        self.views.push(GltfBufferView {
            buffer: 0,
            byte_offset: aligned,
            byte_length: bytes.len(),
            byte_stride: None,
            target,
        });
        self.binary.extend_from_slice(&bytes);
        if let Some(map) = self.shared.as_mut() {
            map.insert((bytes, target), view_index);
        }
        view_index
    }
}

fn encode_document(doc: &Document, placement: ImagePlacement) -> MeshpressResult<EncodedDocument> {
    let mut builder = BufferBuilder::new(doc.shared_accessors);
    let mut accessors = Vec::new();
    let mut meshes_out = Vec::with_capacity(doc.meshes.len());

    for mesh in &doc.meshes {
        let mut primitives = Vec::with_capacity(mesh.primitives.len());
        for primitive in &mesh.primitives {
            primitives.push(encode_primitive(primitive, &mut builder, &mut accessors));
        }
        meshes_out.push(GltfMesh {
            name: mesh.name.clone(),
            primitives,
        });
    }

    // Sampler table shared across textures.
    let mut samplers: Vec<GltfSampler> = Vec::new();
    let mut sampler_lookup: HashMap<SamplerDesc, usize> = HashMap::new();

    let mut images = Vec::with_capacity(doc.textures.len());
    let mut textures_out = Vec::with_capacity(doc.textures.len());
    let mut external_images = BTreeMap::new();
    let mut used_names: HashMap<String, usize> = HashMap::new();

    for (index, texture) in doc.textures.iter().enumerate() {
        let sampler = texture.sampler.map(|desc| {
            *sampler_lookup.entry(desc).or_insert_with(|| {
                samplers.push(GltfSampler {
                    mag_filter: desc.mag_filter,
                    min_filter: desc.min_filter,
                    wrap_s: desc.wrap_s,
                    wrap_t: desc.wrap_t,
                });
                samplers.len() - 1
            })
        });

        let image = match placement {
            ImagePlacement::Embedded => {
                let view = builder.push_view(texture.image.clone(), None);
                GltfImage {
                    name: texture.name.clone(),
                    uri: None,
                    mime_type: Some(texture.mime_type.clone()),
                    buffer_view: Some(view),
                }
            }
            ImagePlacement::External => {
                let file_name = unique_image_name(texture, index, &mut used_names);
                external_images.insert(file_name.clone(), texture.image.clone());
                GltfImage {
                    name: texture.name.clone(),
                    uri: Some(file_name),
                    mime_type: Some(texture.mime_type.clone()),
                    buffer_view: None,
                }
            }
        };
        images.push(image);
        textures_out.push(GltfTexture {
            name: texture.name.clone(),
            sampler,
            source: Some(index),
        });
    }

    let materials_out = doc.materials.iter().map(encode_material).collect();

    let nodes_out = doc
        .nodes
        .iter()
        .map(|node| GltfNode {
            name: node.name.clone(),
            mesh: node.mesh,
            children: node.children.clone(),
            matrix: None,
            translation: (node.translation != [0.0; 3]).then_some(node.translation),
            rotation: (node.rotation != [0.0, 0.0, 0.0, 1.0]).then_some(node.rotation),
            scale: (node.scale != [1.0; 3]).then_some(node.scale),
        })
        .collect();

    let scenes_out = doc
        .scenes
        .iter()
        .map(|scene| GltfScene {
            name: scene.name.clone(),
            nodes: scene.nodes.clone(),
        })
        .collect();

    let quantized = doc.meshes.iter().any(|mesh| {
        mesh.primitives
            .iter()
            .any(|p| p.storage.position.is_normalized())
    });
    let extensions: Vec<String> = if quantized {
        vec!["KHR_mesh_quantization".to_owned()]
    } else {
        Vec::new()
    };

    let buffers = if builder.binary.is_empty() {
        Vec::new()
    } else {
        vec![GltfBuffer {
            uri: match placement {
                ImagePlacement::Embedded => None,
                ImagePlacement::External => Some(BUFFER_RESOURCE_NAME.to_owned()),
            },
            byte_length: builder.binary.len(),
        }]
    };

    let root = GltfRoot {
        asset: GltfAsset {
            version: "2.0".to_owned(),
            generator: Some(
                doc.generator
                    .clone()
                    .unwrap_or_else(|| format!("meshpress {}", env!("CARGO_PKG_VERSION"))),
            ),
        },
        accessors,
        buffer_views: builder.views,
        buffers,
        images,
        samplers,
        textures: textures_out,
        materials: materials_out,
        meshes: meshes_out,
        nodes: nodes_out,
        scene: doc.default_scene,
        scenes: scenes_out,
        extensions_used: extensions.clone(),
        extensions_required: extensions,
    };

    Ok(EncodedDocument {
        root,
        binary: builder.binary,
        external_images,
    })
}

fn unique_image_name(
    texture: &Texture,
    index: usize,
    used: &mut HashMap<String, usize>,
) -> String {
    let stem = sanitize_name(&texture_display_name(texture, index));
    let extension = extension_for_mime(&texture.mime_type);
    let base = format!("{stem}.{extension}");
    let slot = used.entry(base.clone()).or_insert(0);
    *slot += 1;
    if *slot == 1 {
        base
    } else {
        format!("{stem}_{index}.{extension}")
    }
}

fn sanitize_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "texture".to_owned()
    } else {
        cleaned
    }
}

fn encode_material(material: &Material) -> GltfMaterial {
    let texture_ref = |index: Option<usize>| {
        index.map(|index| GltfTextureRef {
            index,
            tex_coord: 0,
        })
    };
    GltfMaterial {
        name: material.name.clone(),
        pbr_metallic_roughness: Some(GltfPbrMetallicRoughness {
            base_color_factor: Some(material.base_color_factor),
            base_color_texture: texture_ref(material.base_color_texture),
            metallic_factor: Some(material.metallic_factor),
            roughness_factor: Some(material.roughness_factor),
            metallic_roughness_texture: texture_ref(material.metallic_roughness_texture),
        }),
        normal_texture: texture_ref(material.normal_texture),
        occlusion_texture: texture_ref(material.occlusion_texture),
        emissive_texture: texture_ref(material.emissive_texture),
        emissive_factor: (material.emissive_factor != [0.0; 3]).then_some(material.emissive_factor),
        alpha_mode: match material.alpha_mode {
            AlphaMode::Opaque => None,
            AlphaMode::Mask => Some("MASK".to_owned()),
            AlphaMode::Blend => Some("BLEND".to_owned()),
        },
        alpha_cutoff: material.alpha_cutoff,
        double_sided: material.double_sided,
    }
}

fn encode_primitive(
    primitive: &Primitive,
    builder: &mut BufferBuilder,
    accessors: &mut Vec<GltfAccessor>,
) -> GltfPrimitive {
    let mut attributes = BTreeMap::new();

    let flat_positions: Vec<f32> = primitive.positions.iter().flatten().copied().collect();
    attributes.insert(
        "POSITION".to_owned(),
        push_attribute_accessor(
            builder,
            accessors,
            &flat_positions,
            3,
            primitive.storage.position,
            true,
        ),
    );

    if let Some(normals) = &primitive.normals {
        let flat: Vec<f32> = normals.iter().flatten().copied().collect();
        attributes.insert(
            "NORMAL".to_owned(),
            push_attribute_accessor(builder, accessors, &flat, 3, primitive.storage.normal, false),
        );
    }

    if let Some(tex_coords) = &primitive.tex_coords {
        let flat: Vec<f32> = tex_coords.iter().flatten().copied().collect();
        attributes.insert(
            "TEXCOORD_0".to_owned(),
            push_attribute_accessor(
                builder,
                accessors,
                &flat,
                2,
                primitive.storage.tex_coord,
                false,
            ),
        );
    }

    if let Some(colors) = &primitive.colors {
        let flat: Vec<f32> = colors.iter().flatten().copied().collect();
        attributes.insert(
            "COLOR_0".to_owned(),
            push_attribute_accessor(builder, accessors, &flat, 4, primitive.storage.color, false),
        );
    }

    let indices = Some(push_index_accessor(builder, accessors, &primitive.indices));

    GltfPrimitive {
        attributes,
        indices,
        material: primitive.material,
        mode: None,
    }
}

fn push_attribute_accessor(
    builder: &mut BufferBuilder,
    accessors: &mut Vec<GltfAccessor>,
    flat: &[f32],
    components: usize,
    storage: ComponentStorage,
    with_bounds: bool,
) -> usize {
    let bytes = encode_components(flat, storage);
    let view = builder.push_view(bytes, Some(schema::TARGET_ARRAY_BUFFER));

    let (min, max) = if with_bounds && !flat.is_empty() {
        let mut min = vec![f64::INFINITY; components];
        let mut max = vec![f64::NEG_INFINITY; components];
        for element in flat.chunks_exact(components) {
            for (component, &value) in element.iter().enumerate() {
                let stored = stored_value(value, storage);
                min[component] = min[component].min(stored);
                max[component] = max[component].max(stored);
            }
        }
        (Some(min), Some(max))
    } else {
        (None, None)
    };

    accessors.push(GltfAccessor {
        buffer_view: Some(view),
        byte_offset: 0,
        component_type: storage_component_type(storage),
        normalized: storage.is_normalized(),
        count: flat.len() / components,
        accessor_type: match components {
            1 => "SCALAR",
            2 => "VEC2",
            3 => "VEC3",
            _ => "VEC4",
        }
        .to_owned(),
        max,
        min,
    });
    accessors.len() - 1
}

fn push_index_accessor(
    builder: &mut BufferBuilder,
    accessors: &mut Vec<GltfAccessor>,
    indices: &[u32],
) -> usize {
    let wide = indices.iter().any(|&i| i > u16::MAX as u32);
    let bytes: Vec<u8> = if wide {
        indices.iter().flat_map(|i| i.to_le_bytes()).collect()
    } else {
        indices
            .iter()
            .flat_map(|&i| (i as u16).to_le_bytes())
            .collect()
    };
    let view = builder.push_view(bytes, Some(schema::TARGET_ELEMENT_ARRAY_BUFFER));
    accessors.push(GltfAccessor {
        buffer_view: Some(view),
        byte_offset: 0,
        component_type: if wide {
            schema::COMPONENT_UNSIGNED_INT
        } else {
            schema::COMPONENT_UNSIGNED_SHORT
        },
        normalized: false,
        count: indices.len(),
        accessor_type: "SCALAR".to_owned(),
        max: None,
        min: None,
    });
    accessors.len() - 1
}

fn storage_component_type(storage: ComponentStorage) -> u32 {
    match storage {
        ComponentStorage::F32 => schema::COMPONENT_FLOAT,
        ComponentStorage::U16Norm => schema::COMPONENT_UNSIGNED_SHORT,
        ComponentStorage::I16Norm => schema::COMPONENT_SHORT,
        ComponentStorage::U8Norm => schema::COMPONENT_UNSIGNED_BYTE,
        ComponentStorage::I8Norm => schema::COMPONENT_BYTE,
    }
}

/// The numeric value as stored in the accessor (integer space for
/// normalized storages, logical value for f32).
fn stored_value(value: f32, storage: ComponentStorage) -> f64 {
    match storage {
        ComponentStorage::F32 => value as f64,
        ComponentStorage::U16Norm => (value.clamp(0.0, 1.0) * 65535.0).round() as f64,
        ComponentStorage::I16Norm => (value.clamp(-1.0, 1.0) * 32767.0).round() as f64,
        ComponentStorage::U8Norm => (value.clamp(0.0, 1.0) * 255.0).round() as f64,
        ComponentStorage::I8Norm => (value.clamp(-1.0, 1.0) * 127.0).round() as f64,
    }
}

fn encode_components(flat: &[f32], storage: ComponentStorage) -> Vec<u8> {
    match storage {
        ComponentStorage::F32 => flat.iter().flat_map(|v| v.to_le_bytes()).collect(),
        ComponentStorage::U16Norm => flat
            .iter()
            .flat_map(|v| (((v.clamp(0.0, 1.0) * 65535.0).round()) as u16).to_le_bytes())
            .collect(),
        ComponentStorage::I16Norm => flat
            .iter()
            .flat_map(|v| (((v.clamp(-1.0, 1.0) * 32767.0).round()) as i16).to_le_bytes())
            .collect(),
        ComponentStorage::U8Norm => flat
            .iter()
            .map(|v| ((v.clamp(0.0, 1.0) * 255.0).round()) as u8)
            .collect(),
        ComponentStorage::I8Norm => flat
            .iter()
            .flat_map(|v| (((v.clamp(-1.0, 1.0) * 127.0).round()) as i8).to_le_bytes())
            .collect(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_document() -> Document {
        Document {
            scenes: vec![Scene {
                name: None,
                nodes: vec![0],
            }],
            default_scene: Some(0),
            nodes: vec![Node {
                mesh: Some(0),
                ..Node::default()
            }],
            meshes: vec![Mesh {
                name: Some("tri".into()),
                primitives: vec![Primitive {
                    positions: vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]],
                    indices: vec![0, 1, 2],
                    ..Primitive::default()
                }],
            }],
            ..Document::default()
        }
    }

    #[test]
    fn rejects_bad_magic_naming_expected_and_found() {
        let err = read_binary(b"NOPExxxxxxxxxxxx").unwrap_err();
        let message = err.to_string();
        assert!(message.contains("0x4654"), "missing expected magic: {message}");
        assert!(message.contains("glTF"), "missing magic name: {message}");
    }

    #[test]
    fn rejects_truncated_header() {
        assert!(matches!(
            read_binary(&[0, 1, 2]),
            Err(MeshpressError::Format(_))
        ));
    }

    #[test]
    fn binary_round_trip_preserves_counts_and_size() {
        let doc = small_document();
        let first = write_binary(&doc).expect("write");
        let reread = read_binary(&first).expect("read");
        assert_eq!(reread.stats(), doc.stats());

        let second = write_binary(&reread).expect("rewrite");
        assert_eq!(first.len(), second.len());

        let third = write_binary(&read_binary(&second).expect("read again")).expect("rewrite");
        assert_eq!(second, third);
    }

    #[test]
    fn glb_is_four_byte_aligned() {
        let bytes = write_binary(&small_document()).expect("write");
        assert_eq!(bytes.len() % 4, 0);
        assert_eq!(read_u32_le(&bytes[8..12]) as usize, bytes.len());
    }

    #[test]
    fn json_split_references_buffer_resource() {
        let (json, resources) = write_json(&small_document()).expect("write json");
        assert!(resources.contains_key(BUFFER_RESOURCE_NAME));
        let uri = json["buffers"][0]["uri"].as_str().expect("buffer uri");
        assert_eq!(uri, BUFFER_RESOURCE_NAME);

        let reread = read_json(&json, &MapResolver::new(resources)).expect("read json");
        assert_eq!(reread.stats(), small_document().stats());
    }

    #[test]
    fn data_uri_buffers_decode_inline() {
        let (mut json, resources) = write_json(&small_document()).expect("write json");
        let bin = resources.get(BUFFER_RESOURCE_NAME).expect("bin");
        json["buffers"][0]["uri"] = serde_json::Value::String(format!(
            "data:application/octet-stream;base64,{}",
            BASE64.encode(bin)
        ));
        let reread = read_json(&json, &NoResolver).expect("read data uri");
        assert_eq!(reread.stats(), small_document().stats());
    }

    #[test]
    fn map_resolver_falls_back_to_basename() {
        let mut entries = BTreeMap::new();
        entries.insert("assets/buffer0.bin".to_owned(), vec![1, 2, 3]);
        let resolver = MapResolver::new(entries);
        assert_eq!(resolver.resolve("buffer0.bin"), Some(vec![1, 2, 3]));
        assert_eq!(resolver.resolve("missing.bin"), None);
    }

    #[test]
    fn matrix_decompose_identity() {
        let (t, r, s) = decompose_matrix([
            1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 0.0, 0.0, 0.0, 1.0, 0.0, 5.0, 6.0, 7.0, 1.0,
        ]);
        assert_eq!(t, [5.0, 6.0, 7.0]);
        assert!((r[3] - 1.0).abs() < 1e-6);
        assert_eq!(s, [1.0, 1.0, 1.0]);
    }

    #[test]
    fn quantized_storage_round_trips_component_type() {
        let mut doc = small_document();
        doc.meshes[0].primitives[0].positions =
            vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        doc.meshes[0].primitives[0].storage.position = ComponentStorage::U16Norm;

        let bytes = write_binary(&doc).expect("write");
        let reread = read_binary(&bytes).expect("read");
        assert_eq!(
            reread.meshes[0].primitives[0].storage.position,
            ComponentStorage::U16Norm
        );
        assert_eq!(write_binary(&reread).expect("rewrite").len(), bytes.len());
    }
}
