use crate::{
    device::RenderPassContext,
    resource::{MissingTextureUsageError, ResourceInfo, Texture, TextureView},
    Label,
};

use arrayvec::ArrayVec;
use thiserror::Error;
use wgt::{Color, Extent3d, LoadOp, TextureFormat, TextureUsage};

use std::sync::Arc;

/// Describes a color attachment to a render pass.
#[derive(Clone, Debug)]
pub struct RenderPassColorAttachment<A: hal::Api> {
    /// The view to use as an attachment.
    pub view: Arc<TextureView<A>>,
    /// What happens to the attachment content when the pass starts.
    pub load_op: LoadOp<Color>,
}

/// Describes a depth/stencil attachment to a render pass.
#[derive(Clone, Debug)]
pub struct RenderPassDepthStencilAttachment<A: hal::Api> {
    /// The view to use as an attachment.
    pub view: Arc<TextureView<A>>,
    pub depth_load_op: LoadOp<f32>,
    pub stencil_load_op: LoadOp<u32>,
}

/// Input of `Device::create_render_pass_descriptor`.
#[derive(Debug)]
pub struct RenderPassInfo<'a, A: hal::Api> {
    pub label: Label<'a>,
    pub color_attachments: &'a [RenderPassColorAttachment<A>],
    pub depth_stencil_attachment: Option<RenderPassDepthStencilAttachment<A>>,
}

#[derive(Clone, Debug, Error)]
pub enum CreateRenderPassError {
    #[error("Color attachment count {given} must be between 1 and {limit}")]
    ColorAttachmentCount { given: usize, limit: u32 },
    #[error("Color attachment {index} has format {format:?}, which is not a color format")]
    NotColorFormat { index: usize, format: TextureFormat },
    #[error("Depth/stencil attachment has format {0:?}, which has no depth aspect")]
    NotDepthFormat(TextureFormat),
    #[error(transparent)]
    MissingOutputAttachmentUsage(#[from] MissingTextureUsageError),
    #[error("Attachments have differing sizes: {expected:?} and {actual:?}")]
    AttachmentSizeMismatch { expected: Extent3d, actual: Extent3d },
}

/// A validated set of attachments a render pass draws into.
#[derive(Debug)]
pub struct RenderPassDescriptor<A: hal::Api> {
    pub(crate) color_attachments:
        ArrayVec<RenderPassColorAttachment<A>, { hal::MAX_COLOR_ATTACHMENTS }>,
    pub(crate) depth_stencil_attachment: Option<RenderPassDepthStencilAttachment<A>>,
    pub(crate) extent: Extent3d,
    pub(crate) context: RenderPassContext,
    pub(crate) info: ResourceInfo,
}

impl<A: hal::Api> RenderPassDescriptor<A> {
    pub(crate) fn validate(
        info: &RenderPassInfo<A>,
        limits: &wgt::Limits,
    ) -> Result<(Extent3d, RenderPassContext), CreateRenderPassError> {
        let count = info.color_attachments.len();
        if count == 0 || count > limits.max_color_attachments as usize {
            return Err(CreateRenderPassError::ColorAttachmentCount {
                given: count,
                limit: limits.max_color_attachments,
            });
        }

        let mut extent = None;
        let mut check_view = |view: &TextureView<A>| -> Result<(), CreateRenderPassError> {
            view.parent
                .check_allowed_usage(TextureUsage::OUTPUT_ATTACHMENT)?;
            match extent {
                None => extent = Some(view.extent),
                Some(expected) if expected != view.extent => {
                    return Err(CreateRenderPassError::AttachmentSizeMismatch {
                        expected,
                        actual: view.extent,
                    })
                }
                Some(_) => {}
            }
            Ok(())
        };

        let mut colors = ArrayVec::new();
        for (index, at) in info.color_attachments.iter().enumerate() {
            let format = at.view.format();
            if format.is_depth_stencil() {
                return Err(CreateRenderPassError::NotColorFormat { index, format });
            }
            check_view(&at.view)?;
            colors.push(format);
        }

        let depth_stencil = match info.depth_stencil_attachment {
            Some(ref at) => {
                let format = at.view.format();
                if !format.is_depth_stencil() {
                    return Err(CreateRenderPassError::NotDepthFormat(format));
                }
                check_view(&at.view)?;
                Some(format)
            }
            None => None,
        };

        let extent = extent.unwrap_or_default();
        Ok((
            extent,
            RenderPassContext {
                colors,
                depth_stencil,
            },
        ))
    }

    pub fn extent(&self) -> Extent3d {
        self.extent
    }

    pub fn color_attachment_count(&self) -> usize {
        self.color_attachments.len()
    }

    pub fn label(&self) -> &str {
        self.info.label()
    }

    /// Every texture the pass renders into.
    pub(crate) fn attachment_textures(&self) -> impl Iterator<Item = &Arc<Texture<A>>> + '_ {
        self.color_attachments
            .iter()
            .map(|at| &at.view)
            .chain(self.depth_stencil_attachment.iter().map(|at| &at.view))
            .map(|view| &view.parent)
    }
}
