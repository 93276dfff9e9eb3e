use std::sync::Arc;

use crate::error::ConvResult;
use crate::library::{Capabilities, ConvolutionOp, Primitive, PrimitiveLibrary, ResourceRole};

use super::descriptor::LayoutDescriptor;
use super::resolver::ResolvedConvolution;

/// Backward-bias primitive with its descriptors.
#[derive(Debug)]
pub struct BiasBackward {
    pub primitive: Primitive,
    pub top_diff: LayoutDescriptor,
    pub bias_diff: LayoutDescriptor,
    pub bias_diff_iter: LayoutDescriptor,
}

/// Every primitive and layout descriptor of one convolution shape.
///
/// Built as a unit and dropped as a unit: replacing the set releases all handles
/// and conversion primitives it owns.
#[derive(Debug)]
pub struct PrimitiveSet {
    pub generation: u64,

    pub forward: Primitive,
    pub fwd_bottom_data: LayoutDescriptor,
    pub fwd_top_data: LayoutDescriptor,
    pub fwd_filter_data: LayoutDescriptor,
    pub fwd_bias_data: Option<LayoutDescriptor>,

    pub backward_data: Primitive,
    pub bwdd_bottom_diff: LayoutDescriptor,
    pub bwdd_top_diff: LayoutDescriptor,
    pub bwdd_filter_data: LayoutDescriptor,

    pub backward_filter: Primitive,
    pub bwdf_bottom_data: LayoutDescriptor,
    pub bwdf_top_diff: LayoutDescriptor,
    pub bwdf_filter_diff: LayoutDescriptor,
    pub bwdf_filter_diff_iter: LayoutDescriptor,
    /// Converts backward-filter output into the forward filter layout. Absent when the
    /// two layouts agree or the library build cannot express the conversion.
    pub filter_diff_adapter: Option<LayoutDescriptor>,

    pub backward_bias: Option<BiasBackward>,
}

impl PrimitiveSet {
    pub fn build(
        library: &Arc<dyn PrimitiveLibrary>,
        capabilities: Capabilities,
        resolved: &ResolvedConvolution,
        layer: &str,
        generation: u64,
    ) -> ConvResult<Self> {
        let name = |role: &str| format!("{role} @ {layer}");
        let desc = resolved.conv_desc();
        let bottom = resolved.bottom_layout();
        let top = resolved.top_layout();
        let filter = resolved.filter_layout();

        let forward_op = if resolved.bias {
            ConvolutionOp::ForwardBias
        } else {
            ConvolutionOp::Forward
        };
        let forward = Primitive::convolution(library, forward_op, &desc)?;
        let fwd_bottom_data = LayoutDescriptor::from_primitive(
            &forward,
            ResourceRole::Src,
            bottom.clone(),
            name("fwd_bottom_data"),
        )?;
        let fwd_top_data = LayoutDescriptor::from_primitive(
            &forward,
            ResourceRole::Dst,
            top.clone(),
            name("fwd_top_data"),
        )?;
        let fwd_filter_data = LayoutDescriptor::from_primitive(
            &forward,
            ResourceRole::Filter,
            filter.clone(),
            name("fwd_filter_data"),
        )?;
        let fwd_bias_data = if resolved.bias {
            Some(LayoutDescriptor::from_primitive(
                &forward,
                ResourceRole::Bias,
                resolved.bias_layout(),
                name("fwd_bias_data"),
            )?)
        } else {
            None
        };

        let backward_data = Primitive::convolution(library, ConvolutionOp::BackwardData, &desc)?;
        let bwdd_bottom_diff = LayoutDescriptor::from_primitive(
            &backward_data,
            ResourceRole::DiffSrc,
            bottom.clone(),
            name("bwdd_bottom_diff"),
        )?;
        let bwdd_top_diff = LayoutDescriptor::from_primitive(
            &backward_data,
            ResourceRole::DiffDst,
            top.clone(),
            name("bwdd_top_diff"),
        )?;
        let bwdd_filter_data = LayoutDescriptor::from_primitive(
            &backward_data,
            ResourceRole::Filter,
            filter.clone(),
            name("bwdd_filter_data"),
        )?;

        let backward_filter =
            Primitive::convolution(library, ConvolutionOp::BackwardFilter, &desc)?;
        let bwdf_bottom_data = LayoutDescriptor::from_primitive(
            &backward_filter,
            ResourceRole::Src,
            bottom,
            name("bwdf_bottom_data"),
        )?;
        let bwdf_top_diff = LayoutDescriptor::from_primitive(
            &backward_filter,
            ResourceRole::DiffDst,
            top.clone(),
            name("bwdf_top_diff"),
        )?;

        let bwdf_output = backward_filter.layout(ResourceRole::DiffFilter)?;
        let (filter_diff_layout, filter_diff_adapter) = if capabilities.filter_diff_adapter {
            let fwd_filter = fwd_filter_data.private_layout().clone();
            let adapter = if bwdf_output != fwd_filter {
                Some(LayoutDescriptor::new(
                    Arc::clone(library),
                    name("bwdf2fwd_filter_diff"),
                    fwd_filter.clone(),
                    bwdf_output,
                )?)
            } else {
                None
            };
            (fwd_filter, adapter)
        } else {
            (bwdf_output, None)
        };
        let bwdf_filter_diff = LayoutDescriptor::new(
            Arc::clone(library),
            name("bwdf_filter_diff"),
            filter.clone(),
            filter_diff_layout.clone(),
        )?;
        let bwdf_filter_diff_iter = LayoutDescriptor::new(
            Arc::clone(library),
            name("bwdf_filter_diff_iter"),
            filter,
            filter_diff_layout,
        )?;

        let backward_bias = if resolved.bias {
            let primitive = Primitive::backward_bias(library, &resolved.bias_desc())?;
            let top_diff = LayoutDescriptor::from_primitive(
                &primitive,
                ResourceRole::DiffDst,
                top,
                name("bwdb_top_diff"),
            )?;
            let bias_diff = LayoutDescriptor::from_primitive(
                &primitive,
                ResourceRole::DiffBias,
                resolved.bias_layout(),
                name("bwdb_bias_diff"),
            )?;
            let bias_diff_iter = LayoutDescriptor::from_primitive(
                &primitive,
                ResourceRole::DiffBias,
                resolved.bias_layout(),
                name("bwdb_bias_diff_iter"),
            )?;
            Some(BiasBackward {
                primitive,
                top_diff,
                bias_diff,
                bias_diff_iter,
            })
        } else {
            None
        };

        tracing::debug!(
            layer,
            generation,
            library = library.name(),
            filter_rank = resolved.filter_rank(),
            adapter = filter_diff_adapter.is_some(),
            bias = resolved.bias,
            "built convolution primitives"
        );

        Ok(PrimitiveSet {
            generation,
            forward,
            fwd_bottom_data,
            fwd_top_data,
            fwd_filter_data,
            fwd_bias_data,
            backward_data,
            bwdd_bottom_diff,
            bwdd_top_diff,
            bwdd_filter_data,
            backward_filter,
            bwdf_bottom_data,
            bwdf_top_diff,
            bwdf_filter_diff,
            bwdf_filter_diff_iter,
            filter_diff_adapter,
            backward_bias,
        })
    }
}
