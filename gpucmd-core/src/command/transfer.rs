use crate::{
    checked_range_end,
    resource::{Buffer, Texture},
};

use thiserror::Error;
use wgt::{BufferAddress, Extent3d, Origin3d, TextureFormat};

use std::sync::Arc;

/// A buffer side of a buffer/texture copy.
#[derive(Debug)]
pub struct BufferCopyView<A: hal::Api> {
    pub buffer: Arc<Buffer<A>>,
    pub offset: BufferAddress,
    /// Bytes between two rows of texels. Zero picks the tightest aligned pitch.
    pub row_pitch: u32,
}

/// A texture side of a buffer/texture copy.
#[derive(Debug)]
pub struct TextureCopyView<A: hal::Api> {
    pub texture: Arc<Texture<A>>,
    pub mip_level: u32,
    pub origin: Origin3d,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CopySide {
    Source,
    Destination,
}

/// Error encountered while attempting a data transfer.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum TransferError {
    #[error("copy of {size} bytes at offset {offset} would overrun the {side:?} buffer of size {buffer_size}")]
    BufferOverrun {
        offset: BufferAddress,
        size: BufferAddress,
        buffer_size: BufferAddress,
        side: CopySide,
    },
    #[error("copy of {width}x{height} texels at ({x}, {y}) would touch outside of mip level {level} of the {side:?} texture")]
    TextureOverrun {
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        level: u32,
        side: CopySide,
    },
    #[error("copy mip level {level} is out of range, the texture has {total} levels")]
    InvalidMipLevel { level: u32, total: u32 },
    #[error("copies must use z = 0 and depth = 1, got z = {z} and depth = {depth}")]
    UnsupportedDepth { z: u32, depth: u32 },
    #[error("row pitch {0} must be a multiple of {}", wgt::COPY_ROW_PITCH_ALIGNMENT)]
    UnalignedRowPitch(u32),
    #[error("row pitch {row_pitch} is less than the {required} bytes of one row")]
    RowPitchTooSmall { row_pitch: u32, required: u64 },
    #[error("buffer offset {offset} must be a multiple of the texel size {texel_size}")]
    UnalignedBufferOffset {
        offset: BufferAddress,
        texel_size: u32,
    },
}

/// Returns true if `size` bytes starting at `offset` fit in a buffer of `buffer_size` bytes.
pub(crate) fn fits_in_buffer(
    buffer_size: BufferAddress,
    offset: BufferAddress,
    size: BufferAddress,
) -> bool {
    checked_range_end(offset, size, buffer_size).is_some()
}

pub(crate) fn validate_copy_size_fits_in_buffer<A: hal::Api>(
    buffer: &Buffer<A>,
    offset: BufferAddress,
    size: BufferAddress,
    side: CopySide,
) -> Result<(), TransferError> {
    if fits_in_buffer(buffer.size, offset, size) {
        Ok(())
    } else {
        Err(TransferError::BufferOverrun {
            offset,
            size,
            buffer_size: buffer.size,
            side,
        })
    }
}

pub(crate) fn validate_copy_location_fits_in_texture<A: hal::Api>(
    view: &TextureCopyView<A>,
    copy_size: &Extent3d,
    side: CopySide,
) -> Result<(), TransferError> {
    let texture = &view.texture;
    if view.mip_level >= texture.mip_level_count {
        return Err(TransferError::InvalidMipLevel {
            level: view.mip_level,
            total: texture.mip_level_count,
        });
    }

    // Dimensions are u32, adding them as u64 can't overflow.
    let level_size = texture.size.at_mip_level(view.mip_level);
    let overrun = view.origin.x as u64 + copy_size.width as u64 > level_size.width as u64
        || view.origin.y as u64 + copy_size.height as u64 > level_size.height as u64;
    if overrun {
        return Err(TransferError::TextureOverrun {
            x: view.origin.x,
            y: view.origin.y,
            width: copy_size.width,
            height: copy_size.height,
            level: view.mip_level,
            side,
        });
    }

    if view.origin.z != 0 || copy_size.depth != 1 {
        return Err(TransferError::UnsupportedDepth {
            z: view.origin.z,
            depth: copy_size.depth,
        });
    }
    Ok(())
}

/// Tightest row pitch for `width` texels, rounded up to the copy alignment.
pub(crate) fn default_row_pitch(format: TextureFormat, width: u32) -> u32 {
    let bytes = width as u64 * format.texel_size() as u64;
    let alignment = wgt::COPY_ROW_PITCH_ALIGNMENT as u64;
    let aligned = (bytes + alignment - 1) / alignment * alignment;
    aligned.min(u32::MAX as u64 / alignment * alignment) as u32
}

pub(crate) fn validate_row_pitch(
    format: TextureFormat,
    copy_size: &Extent3d,
    row_pitch: u32,
) -> Result<(), TransferError> {
    if row_pitch % wgt::COPY_ROW_PITCH_ALIGNMENT != 0 {
        return Err(TransferError::UnalignedRowPitch(row_pitch));
    }
    let required = copy_size.width as u64 * format.texel_size() as u64;
    if (row_pitch as u64) < required {
        return Err(TransferError::RowPitchTooSmall {
            row_pitch,
            required,
        });
    }
    Ok(())
}

pub(crate) fn validate_texel_buffer_offset(
    format: TextureFormat,
    offset: BufferAddress,
) -> Result<(), TransferError> {
    let texel_size = format.texel_size();
    if offset % texel_size as u64 != 0 {
        return Err(TransferError::UnalignedBufferOffset { offset, texel_size });
    }
    Ok(())
}

/// Number of buffer bytes a copy of `copy_size` texels touches with `row_pitch`.
pub(crate) fn required_buffer_size(
    format: TextureFormat,
    copy_size: &Extent3d,
    row_pitch: u32,
) -> BufferAddress {
    if copy_size.width == 0 || copy_size.height == 0 || copy_size.depth == 0 {
        return 0;
    }
    // Each factor fits in 32 bits, so both products fit in 64 bits.
    let last_row = copy_size.width as u64 * format.texel_size() as u64;
    row_pitch as u64 * (copy_size.height as u64 - 1) + last_row
}

/// Checks everything about a buffer/texture copy that doesn't depend on usage state.
pub(crate) fn validate_buffer_texture_copy<A: hal::Api>(
    buffer: &BufferCopyView<A>,
    texture: &TextureCopyView<A>,
    copy_size: &Extent3d,
    texture_side: CopySide,
) -> Result<(), TransferError> {
    let buffer_side = match texture_side {
        CopySide::Source => CopySide::Destination,
        CopySide::Destination => CopySide::Source,
    };
    let format = texture.texture.format;
    validate_copy_location_fits_in_texture(texture, copy_size, texture_side)?;
    validate_row_pitch(format, copy_size, buffer.row_pitch)?;
    validate_texel_buffer_offset(format, buffer.offset)?;
    let size = required_buffer_size(format, copy_size, buffer.row_pitch);
    validate_copy_size_fits_in_buffer(&buffer.buffer, buffer.offset, size, buffer_side)
}
