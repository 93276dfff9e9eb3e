//! Primitive library contract.
//!
//! A primitive library compiles shape-specific convolution and layout conversion
//! operations and hands back opaque handles. The convolution core never looks
//! inside a handle: it asks the library which layout each resource slot expects,
//! binds buffers in those layouts, and executes. Libraries report failures as a
//! raw numeric [`Status`]; the core attaches the operation name.

use std::fmt;

use crate::layout::{Dims, Layout};
use crate::ops::{conv_out_dim, ConvGeometry};

pub mod capability;
pub mod handles;
pub mod primitive;
pub mod registry;
pub mod resources;
#[cfg(test)]
pub(crate) mod testing;

pub use capability::{Capabilities, LibraryBuild};
pub use handles::HandleTable;
pub use primitive::Primitive;
pub use resources::{ResourceRole, Resources};

/// Non-zero status code returned by a failing library call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Status(i32);

impl Status {
    pub const INCORRECT_INPUT_PARAMETER: Status = Status(-1);
    pub const UNEXPECTED_NULL_POINTER: Status = Status(-2);
    pub const MEMORY_ERROR: Status = Status(-3);
    pub const UNSUPPORTED_DIMENSION: Status = Status(-4);
    pub const UNIMPLEMENTED: Status = Status(-127);

    pub const fn from_code(code: i32) -> Self {
        Status(code)
    }

    pub const fn code(self) -> i32 {
        self.0
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match *self {
            Status::INCORRECT_INPUT_PARAMETER => "incorrect input parameter",
            Status::UNEXPECTED_NULL_POINTER => "unexpected null pointer",
            Status::MEMORY_ERROR => "memory error",
            Status::UNSUPPORTED_DIMENSION => "unsupported dimension",
            Status::UNIMPLEMENTED => "unimplemented",
            _ => "library error",
        };
        write!(f, "{} ({label})", self.0)
    }
}

pub type LibraryResult<T> = Result<T, Status>;

/// Opaque primitive handle issued by a library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawPrimitive(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConvolutionOp {
    Forward,
    ForwardBias,
    BackwardData,
    BackwardFilter,
}

impl ConvolutionOp {
    pub fn create_name(self) -> &'static str {
        match self {
            ConvolutionOp::Forward => "create forward convolution",
            ConvolutionOp::ForwardBias => "create forward convolution with bias",
            ConvolutionOp::BackwardData => "create backward-data convolution",
            ConvolutionOp::BackwardFilter => "create backward-filter convolution",
        }
    }

    /// Resource slots a primitive of this kind binds.
    pub fn roles(self) -> &'static [ResourceRole] {
        use ResourceRole::*;
        match self {
            ConvolutionOp::Forward => &[Src, Filter, Dst],
            ConvolutionOp::ForwardBias => &[Src, Filter, Bias, Dst],
            ConvolutionOp::BackwardData => &[DiffDst, Filter, DiffSrc],
            ConvolutionOp::BackwardFilter => &[Src, DiffDst, DiffFilter],
        }
    }
}

/// Resource slots of a backward-bias primitive.
pub const BACKWARD_BIAS_ROLES: &[ResourceRole] = &[ResourceRole::DiffDst, ResourceRole::DiffBias];

/// Resource slots of a layout conversion primitive.
pub const CONVERSION_ROLES: &[ResourceRole] = &[ResourceRole::From, ResourceRole::To];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BorderMode {
    Zeros,
}

/// Geometry of a convolution primitive in library terms.
///
/// Size vectors are fastest-varying first. `filter_sizes` is
/// `{kw, kh, ic/g, oc}` for rank 4 or `{kw, kh, ic/g, oc/g, g}` for rank 5;
/// `input_offset` holds the negated padding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConvolutionDesc {
    pub groups: usize,
    pub dimension: usize,
    pub src_sizes: [usize; 4],
    pub dst_sizes: [usize; 4],
    pub filter_sizes: Dims,
    pub strides: [usize; 2],
    pub input_offset: [isize; 2],
    pub border: BorderMode,
}

impl ConvolutionDesc {
    /// Validates the descriptor and returns the equivalent NCHW geometry.
    pub fn geometry(&self) -> LibraryResult<ConvGeometry> {
        if self.dimension != 4 {
            return Err(Status::UNSUPPORTED_DIMENSION);
        }
        let [iw, ih, ic, n] = self.src_sizes;
        let [ow, oh, oc, dst_n] = self.dst_sizes;
        let groups = self.groups;
        if groups == 0 || ic % groups != 0 || oc % groups != 0 || dst_n != n {
            return Err(Status::INCORRECT_INPUT_PARAMETER);
        }
        let (kw, kh, icg, filter_oc) = match self.filter_sizes.as_slice() {
            &[kw, kh, icg, oc] => (kw, kh, icg, oc),
            &[kw, kh, icg, ocg, g] if g == groups => (kw, kh, icg, ocg * g),
            _ => return Err(Status::INCORRECT_INPUT_PARAMETER),
        };
        if icg * groups != ic || filter_oc != oc {
            return Err(Status::INCORRECT_INPUT_PARAMETER);
        }
        let [sw, sh] = self.strides;
        let [off_w, off_h] = self.input_offset;
        if off_w > 0 || off_h > 0 {
            return Err(Status::INCORRECT_INPUT_PARAMETER);
        }
        let (pad_w, pad_h) = (off_w.unsigned_abs(), off_h.unsigned_abs());
        let expected_w =
            conv_out_dim(iw, kw, sw, pad_w).map_err(|_| Status::INCORRECT_INPUT_PARAMETER)?;
        let expected_h =
            conv_out_dim(ih, kh, sh, pad_h).map_err(|_| Status::INCORRECT_INPUT_PARAMETER)?;
        if expected_w != ow || expected_h != oh {
            return Err(Status::INCORRECT_INPUT_PARAMETER);
        }
        Ok(ConvGeometry {
            batch: n,
            in_channels: ic,
            in_h: ih,
            in_w: iw,
            out_channels: oc,
            out_h: oh,
            out_w: ow,
            kernel_h: kh,
            kernel_w: kw,
            stride_h: sh,
            stride_w: sw,
            pad_h,
            pad_w,
            groups,
        })
    }

    pub fn src_layout(&self) -> Layout {
        Layout::packed(&self.src_sizes)
    }

    pub fn dst_layout(&self) -> Layout {
        Layout::packed(&self.dst_sizes)
    }

    pub fn filter_layout(&self) -> Layout {
        Layout::packed(&self.filter_sizes)
    }

    pub fn bias_layout(&self) -> Layout {
        Layout::packed(&[self.dst_sizes[2]])
    }
}

/// Geometry of a backward-bias primitive: only the output extents matter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BiasGradDesc {
    pub groups: usize,
    pub dimension: usize,
    pub dst_sizes: [usize; 4],
}

impl BiasGradDesc {
    pub fn validate(&self) -> LibraryResult<()> {
        if self.dimension != 4 {
            return Err(Status::UNSUPPORTED_DIMENSION);
        }
        if self.groups == 0 || self.dst_sizes[2] % self.groups != 0 {
            return Err(Status::INCORRECT_INPUT_PARAMETER);
        }
        Ok(())
    }

    pub fn dst_layout(&self) -> Layout {
        Layout::packed(&self.dst_sizes)
    }

    pub fn bias_layout(&self) -> Layout {
        Layout::packed(&[self.dst_sizes[2]])
    }
}

/// An optimized tensor-primitive library.
///
/// Implementations own the compiled state behind every handle they issue and must
/// tolerate `release` being the last call made for a handle. Outputs bound to
/// [`Resources`] are overwritten, never accumulated into.
pub trait PrimitiveLibrary: Send + Sync {
    fn name(&self) -> &str;

    fn build(&self) -> LibraryBuild;

    fn create_convolution(
        &self,
        op: ConvolutionOp,
        desc: &ConvolutionDesc,
    ) -> LibraryResult<RawPrimitive>;

    fn create_backward_bias(&self, desc: &BiasGradDesc) -> LibraryResult<RawPrimitive>;

    fn create_conversion(&self, from: &Layout, to: &Layout) -> LibraryResult<RawPrimitive>;

    /// Layout the primitive expects for `role`.
    fn layout_of(&self, primitive: RawPrimitive, role: ResourceRole) -> LibraryResult<Layout>;

    fn execute(&self, primitive: RawPrimitive, resources: &mut Resources<'_>)
        -> LibraryResult<()>;

    fn release(&self, primitive: RawPrimitive) -> LibraryResult<()>;

    /// Handles issued and not yet released.
    fn live_primitives(&self) -> usize;
}
