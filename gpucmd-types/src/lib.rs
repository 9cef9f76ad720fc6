/*! This library describes the plain data types shared by the gpucmd crates.
 *  Nothing in here owns a GPU object: these are limits, usage flags, formats
 *  and the value parts of descriptors.
 */

#![allow(
    // We don't use syntax sugar where it's not necessary.
    clippy::match_like_matches_macro,
)]
#![warn(missing_docs, unused_qualifications)]

use std::ops::Range;

/// Integral type used for buffer offsets.
pub type BufferAddress = u64;
/// Integral type used for dynamic bind group offsets.
pub type DynamicOffset = u32;
/// Integral type used for binding locations in shaders.
pub type ShaderLocation = u32;

/// Maximum amount of bind groups a pipeline layout can reference.
pub const MAX_BIND_GROUPS: usize = 4;
/// Maximum binding index (exclusive) inside a bind group layout.
pub const MAX_BINDINGS_PER_GROUP: usize = 16;
/// Maximum amount of vertex attributes in an input state.
pub const MAX_VERTEX_ATTRIBUTES: usize = 16;
/// Maximum amount of vertex buffer slots in an input state.
pub const MAX_VERTEX_INPUTS: usize = 16;
/// Maximum stride of a single vertex input.
pub const MAX_VERTEX_STRIDE: u32 = 2048;
/// Number of 32-bit push constant slots available to every stage.
pub const MAX_PUSH_CONSTANTS: usize = 32;
/// Maximum amount of color attachments in a render pass.
pub const MAX_COLOR_ATTACHMENTS: usize = 4;
/// Maximum amount of bindings with dynamic offsets in a single bind group layout.
pub const MAX_DYNAMIC_BUFFERS: usize = 8;
/// Row pitch of buffer-texture copies must be a multiple of this.
pub const COPY_ROW_PITCH_ALIGNMENT: u32 = 256;
/// Dynamic offsets passed to `set_bind_group` must be a multiple of this.
pub const DYNAMIC_OFFSET_ALIGNMENT: DynamicOffset = 256;

/// Returns true if the value is zero or a power of two.
pub fn has_zero_or_one_bits(bits: u32) -> bool {
    bits & bits.wrapping_sub(1) == 0
}

/// Numeric caps of a device.
///
/// These are read at validation time. Every limit must be lower or equal to the
/// compile-time maximum of the same concern.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Limits {
    /// Amount of bind groups that can be attached to a pipeline at the same time. Defaults to 4.
    pub max_bind_groups: u32,
    /// Amount of bindings with dynamic offsets in one bind group layout. Defaults to 8.
    pub max_dynamic_buffers_per_layout: u32,
    /// Amount of vertex buffer slots. Defaults to 16.
    pub max_vertex_buffers: u32,
    /// Amount of color attachments in a render pass. Defaults to 4.
    pub max_color_attachments: u32,
    /// Maximum size in bytes of a uniform buffer binding. Defaults to 16 KB.
    pub max_uniform_binding_size: u32,
    /// Maximum size in bytes of a buffer. Defaults to 256 MB.
    pub max_buffer_size: BufferAddress,
    /// Maximum width and height of a texture. Defaults to 8192.
    pub max_texture_dimension_2d: u32,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_bind_groups: MAX_BIND_GROUPS as u32,
            max_dynamic_buffers_per_layout: MAX_DYNAMIC_BUFFERS as u32,
            max_vertex_buffers: MAX_VERTEX_INPUTS as u32,
            max_color_attachments: MAX_COLOR_ATTACHMENTS as u32,
            max_uniform_binding_size: 16 << 10,
            max_buffer_size: 256 << 20,
            max_texture_dimension_2d: 8192,
        }
    }
}

impl Limits {
    /// Returns the name of the first limit that exceeds the compile-time maximum.
    pub fn check_maxima(&self) -> Option<&'static str> {
        if self.max_bind_groups as usize > MAX_BIND_GROUPS {
            Some("max_bind_groups")
        } else if self.max_dynamic_buffers_per_layout as usize > MAX_DYNAMIC_BUFFERS {
            Some("max_dynamic_buffers_per_layout")
        } else if self.max_vertex_buffers as usize > MAX_VERTEX_INPUTS {
            Some("max_vertex_buffers")
        } else if self.max_color_attachments as usize > MAX_COLOR_ATTACHMENTS {
            Some("max_color_attachments")
        } else {
            None
        }
    }
}

bitflags::bitflags! {
    /// Different ways that you can use a buffer.
    #[repr(transparent)]
    pub struct BufferUsage: u32 {
        /// Allow a buffer to be mapped for reading.
        const MAP_READ = 1 << 0;
        /// Allow a buffer to be mapped for writing.
        const MAP_WRITE = 1 << 1;
        /// Allow a buffer to be the source buffer of a copy.
        const TRANSFER_SRC = 1 << 2;
        /// Allow a buffer to be the destination buffer of a copy or `set_sub_data`.
        const TRANSFER_DST = 1 << 3;
        /// Allow a buffer to be the index buffer in a draw operation.
        const INDEX = 1 << 4;
        /// Allow a buffer to be the vertex buffer in a draw operation.
        const VERTEX = 1 << 5;
        /// Allow a buffer to be a uniform binding in a bind group.
        const UNIFORM = 1 << 6;
        /// Allow a buffer to be a storage binding in a bind group.
        const STORAGE = 1 << 7;
    }
}

impl BufferUsage {
    /// Usages that several readers can share at the same time.
    pub const READ_ONLY: Self = Self::from_bits_truncate(
        Self::MAP_READ.bits
            | Self::TRANSFER_SRC.bits
            | Self::INDEX.bits
            | Self::VERTEX.bits
            | Self::UNIFORM.bits,
    );
}

bitflags::bitflags! {
    /// Different ways that you can use a texture.
    #[repr(transparent)]
    pub struct TextureUsage: u32 {
        /// Allow a texture to be the source of a copy.
        const TRANSFER_SRC = 1 << 0;
        /// Allow a texture to be the destination of a copy.
        const TRANSFER_DST = 1 << 1;
        /// Allow a texture to be sampled through a bind group.
        const SAMPLED = 1 << 2;
        /// Allow a texture to be a storage binding.
        const STORAGE = 1 << 3;
        /// Allow a texture to be an attachment of a render pass.
        const OUTPUT_ATTACHMENT = 1 << 4;
        /// Allow a texture to be presented.
        const PRESENT = 1 << 5;
    }
}

impl TextureUsage {
    /// Usages that several readers can share at the same time.
    pub const READ_ONLY: Self = Self::from_bits_truncate(
        Self::TRANSFER_SRC.bits | Self::SAMPLED.bits | Self::PRESENT.bits,
    );
}

bitflags::bitflags! {
    /// Describes the shader stages that a binding or push constant will be visible from.
    #[repr(transparent)]
    pub struct ShaderStage: u32 {
        /// Binding is visible from the vertex shader of a render pipeline.
        const VERTEX = 1 << 0;
        /// Binding is visible from the fragment shader of a render pipeline.
        const FRAGMENT = 1 << 1;
        /// Binding is visible from the compute shader of a compute pipeline.
        const COMPUTE = 1 << 2;
        /// Binding is visible from the vertex and fragment shaders of a render pipeline.
        const VERTEX_FRAGMENT = Self::VERTEX.bits | Self::FRAGMENT.bits;
    }
}

/// Format of indices used with pipeline.
#[repr(C)]
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum IndexFormat {
    /// Indices are 16 bit unsigned integers.
    Uint16 = 0,
    /// Indices are 32 bit unsigned integers.
    Uint32 = 1,
}

impl Default for IndexFormat {
    fn default() -> Self {
        Self::Uint32
    }
}

impl IndexFormat {
    /// Size in bytes of one index.
    pub fn byte_size(self) -> BufferAddress {
        match self {
            Self::Uint16 => 2,
            Self::Uint32 => 4,
        }
    }
}

/// Type of a binding in a bind group layout.
#[repr(C)]
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum BindingType {
    /// A uniform buffer.
    UniformBuffer,
    /// A storage buffer.
    StorageBuffer,
    /// A sampler.
    Sampler,
    /// A texture that can be sampled.
    SampledTexture,
}

impl BindingType {
    /// True for the bindings that take a buffer range.
    pub fn is_buffer(self) -> bool {
        match self {
            Self::UniformBuffer | Self::StorageBuffer => true,
            _ => false,
        }
    }

    /// The buffer usage a bound buffer must have, if any.
    pub fn buffer_usage(self) -> BufferUsage {
        match self {
            Self::UniformBuffer => BufferUsage::UNIFORM,
            Self::StorageBuffer => BufferUsage::STORAGE,
            _ => BufferUsage::empty(),
        }
    }
}

/// Describes a single binding inside a bind group layout.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct BindGroupLayoutEntry {
    /// Binding index. Must be lower than `MAX_BINDINGS_PER_GROUP`.
    pub binding: u32,
    /// Which shader stages can see this binding.
    pub visibility: ShaderStage,
    /// The type of the binding.
    pub ty: BindingType,
    /// The binding takes a dynamic offset at `set_bind_group` time.
    pub has_dynamic_offset: bool,
}

/// Underlying texture data format.
#[repr(C)]
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum TextureFormat {
    /// Red, green, blue, and alpha channels. 8 bit integer per channel. [0, 255] converted to/from float [0, 1] in shader.
    R8G8B8A8Unorm,
    /// Red and green channels. 8 bit integer per channel. [0, 255] converted to/from float [0, 1] in shader.
    R8G8Unorm,
    /// Red channel only. 8 bit integer per channel. [0, 255] converted to/from float [0, 1] in shader.
    R8Unorm,
    /// Red, green, blue, and alpha channels. 8 bit integer per channel.
    R8G8B8A8Uint,
    /// Blue, green, red, and alpha channels. 8 bit integer per channel. [0, 255] converted to/from float [0, 1] in shader.
    B8G8R8A8Unorm,
    /// Special depth format with at least 24 bit integer depth and 8 bit stencil.
    D32FloatS8Uint,
}

impl TextureFormat {
    /// Size in bytes of one texel.
    pub fn texel_size(self) -> u32 {
        match self {
            Self::R8Unorm => 1,
            Self::R8G8Unorm => 2,
            Self::R8G8B8A8Unorm | Self::R8G8B8A8Uint | Self::B8G8R8A8Unorm => 4,
            Self::D32FloatS8Uint => 8,
        }
    }

    /// True for formats with a depth or stencil aspect.
    pub fn is_depth_stencil(self) -> bool {
        match self {
            Self::D32FloatS8Uint => true,
            _ => false,
        }
    }
}

/// Extent of a texture related operation.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Extent3d {
    #[allow(missing_docs)]
    pub width: u32,
    #[allow(missing_docs)]
    pub height: u32,
    #[allow(missing_docs)]
    pub depth: u32,
}

impl Extent3d {
    /// Size of the given mip level. Dimensions never go below 1.
    pub fn at_mip_level(&self, level: u32) -> Self {
        Self {
            width: self.width.checked_shr(level).unwrap_or(0).max(1),
            height: self.height.checked_shr(level).unwrap_or(0).max(1),
            depth: self.depth,
        }
    }

    /// Number of mip levels a full chain of this extent has.
    pub fn max_mips(&self) -> u32 {
        let max_dim = self.width.max(self.height);
        32 - max_dim.leading_zeros()
    }
}

/// Origin of a copy to/from a texture.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Origin3d {
    #[allow(missing_docs)]
    pub x: u32,
    #[allow(missing_docs)]
    pub y: u32,
    #[allow(missing_docs)]
    pub z: u32,
}

/// RGBA double precision color.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Color {
    #[allow(missing_docs)]
    pub r: f64,
    #[allow(missing_docs)]
    pub g: f64,
    #[allow(missing_docs)]
    pub b: f64,
    #[allow(missing_docs)]
    pub a: f64,
}

impl Color {
    #[allow(missing_docs)]
    pub const TRANSPARENT: Self = Self {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 0.0,
    };
    #[allow(missing_docs)]
    pub const BLACK: Self = Self {
        r: 0.0,
        g: 0.0,
        b: 0.0,
        a: 1.0,
    };
}

/// Operation to perform to the attachment at the start of a render pass.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum LoadOp<V> {
    /// Clear with a specified value.
    Clear(V),
    /// Load from memory.
    Load,
}

impl<V: Default> Default for LoadOp<V> {
    fn default() -> Self {
        Self::Clear(Default::default())
    }
}

/// Whether a vertex buffer is indexed by vertex or by instance.
#[repr(C)]
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum InputStepMode {
    /// Vertex data is advanced every vertex.
    Vertex = 0,
    /// Vertex data is advanced every instance.
    Instance = 1,
}

impl Default for InputStepMode {
    fn default() -> Self {
        Self::Vertex
    }
}

/// Vertex format for a vertex attribute.
#[repr(C)]
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum VertexFormat {
    /// Four unsigned bytes (u8). [0, 255] converted to float [0, 1] `vec4` in shaders.
    UChar4Norm,
    /// One single-precision float (f32). `float` in shaders.
    Float,
    /// Two single-precision floats (f32). `vec2` in shaders.
    Float2,
    /// Three single-precision floats (f32). `vec3` in shaders.
    Float3,
    /// Four single-precision floats (f32). `vec4` in shaders.
    Float4,
    /// One unsigned int (u32). `uint` in shaders.
    Uint,
}

impl VertexFormat {
    /// Size in bytes of one attribute of this format.
    pub fn size(self) -> u32 {
        match self {
            Self::UChar4Norm | Self::Float | Self::Uint => 4,
            Self::Float2 => 8,
            Self::Float3 => 12,
            Self::Float4 => 16,
        }
    }
}

/// Describes one vertex buffer slot of an input state.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct VertexInput {
    /// Vertex buffer slot.
    pub slot: u32,
    /// Bytes between two consecutive elements.
    pub stride: u32,
    /// How often the slot steps forward.
    pub step_mode: InputStepMode,
}

/// Describes one vertex attribute of an input state.
#[derive(Clone, Copy, Debug, Hash, Eq, PartialEq)]
pub struct VertexAttribute {
    /// Location the shader reads the attribute from.
    pub location: ShaderLocation,
    /// Vertex buffer slot the attribute is fetched from.
    pub slot: u32,
    /// Format of the attribute.
    pub format: VertexFormat,
    /// Byte offset inside one element of the slot.
    pub offset: u32,
}

/// Scalar type of one push constant slot.
#[repr(C)]
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum PushConstantType {
    /// 32-bit signed integer.
    Int,
    /// 32-bit unsigned integer.
    UInt,
    /// 32-bit float.
    Float,
}

impl Default for PushConstantType {
    fn default() -> Self {
        Self::UInt
    }
}

/// Texel filtering mode of a sampler.
#[repr(C)]
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum FilterMode {
    /// Nearest neighbor sampling.
    Nearest,
    /// Linear interpolation.
    Linear,
}

/// How edges should be handled in texture addressing.
#[repr(C)]
#[derive(Copy, Clone, Debug, Hash, Eq, PartialEq)]
pub enum AddressMode {
    /// Clamp the value to the edge of the texture.
    ClampToEdge,
    /// Repeat the texture in a tiling fashion.
    Repeat,
    /// Repeat the texture, mirroring it every repeat.
    MirrorRepeat,
}

/// Describes a sampler.
#[derive(Clone, Debug, PartialEq)]
pub struct SamplerDescriptor<L> {
    /// Debug label of the sampler.
    pub label: L,
    /// How to deal with out of bounds accesses in the u, v and w directions.
    pub address_modes: [AddressMode; 3],
    /// How to filter the texture when it needs to be magnified.
    pub mag_filter: FilterMode,
    /// How to filter the texture when it needs to be minified.
    pub min_filter: FilterMode,
    /// How to filter between mip map levels.
    pub mipmap_filter: FilterMode,
    /// Range of level of detail to clamp to.
    pub lod_clamp: Range<f32>,
}

impl<L: Default> Default for SamplerDescriptor<L> {
    fn default() -> Self {
        Self {
            label: L::default(),
            address_modes: [AddressMode::ClampToEdge; 3],
            mag_filter: FilterMode::Nearest,
            min_filter: FilterMode::Nearest,
            mipmap_filter: FilterMode::Nearest,
            lod_clamp: 0.0..32.0,
        }
    }
}

impl<L> SamplerDescriptor<L> {
    /// Takes a closure and maps the label of the sampler descriptor into another.
    pub fn map_label<K>(&self, fun: impl FnOnce(&L) -> K) -> SamplerDescriptor<K> {
        SamplerDescriptor {
            label: fun(&self.label),
            address_modes: self.address_modes,
            mag_filter: self.mag_filter,
            min_filter: self.min_filter,
            mipmap_filter: self.mipmap_filter,
            lod_clamp: self.lod_clamp.clone(),
        }
    }
}

#[test]
fn read_only_sets() {
    assert!(BufferUsage::READ_ONLY.contains(BufferUsage::VERTEX | BufferUsage::UNIFORM));
    assert!(!BufferUsage::READ_ONLY.intersects(BufferUsage::STORAGE | BufferUsage::TRANSFER_DST));
    assert!(!TextureUsage::READ_ONLY.contains(TextureUsage::OUTPUT_ATTACHMENT));
    assert!(has_zero_or_one_bits(0));
    assert!(has_zero_or_one_bits(BufferUsage::STORAGE.bits()));
    assert!(!has_zero_or_one_bits(
        (BufferUsage::STORAGE | BufferUsage::VERTEX).bits()
    ));
}

#[test]
fn mip_extents() {
    let extent = Extent3d {
        width: 256,
        height: 64,
        depth: 1,
    };
    assert_eq!(extent.max_mips(), 9);
    assert_eq!(extent.at_mip_level(3).width, 32);
    assert_eq!(extent.at_mip_level(8).height, 1);
    assert_eq!(Limits::default().check_maxima(), None);
}
