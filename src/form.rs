//! Assembled forms and the externally compiled local kernels that evaluate them.
use crate::space::{CoefficientId, DomainId, FunctionSpace};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// The integration domain of a local kernel.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntegralType {
    Cell,
    ExteriorFacet,
    InteriorFacet,
    /// Vertical exterior facets of an extruded mesh.
    ExteriorFacetVert,
    /// Vertical interior facets of an extruded mesh.
    InteriorFacetVert,
    ExteriorFacetTop,
    ExteriorFacetBottom,
    /// Horizontal interior facets of an extruded mesh.
    InteriorFacetHoriz,
}

impl IntegralType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntegralType::Cell => "cell",
            IntegralType::ExteriorFacet => "exterior_facet",
            IntegralType::InteriorFacet => "interior_facet",
            IntegralType::ExteriorFacetVert => "exterior_facet_vert",
            IntegralType::InteriorFacetVert => "interior_facet_vert",
            IntegralType::ExteriorFacetTop => "exterior_facet_top",
            IntegralType::ExteriorFacetBottom => "exterior_facet_bottom",
            IntegralType::InteriorFacetHoriz => "interior_facet_horiz",
        }
    }

    /// Whether the integral is evaluated inside the loop over the cell facets.
    pub fn is_facet_loop(&self) -> bool {
        use IntegralType::*;
        matches!(self, ExteriorFacet | InteriorFacet | ExteriorFacetVert | InteriorFacetVert)
    }

    /// Whether the integral is dispatched on the mesh layer.
    pub fn is_horizontal(&self) -> bool {
        use IntegralType::*;
        matches!(self, ExteriorFacetTop | ExteriorFacetBottom | InteriorFacetHoriz)
    }

    /// Whether the integral only exists on extruded meshes.
    pub fn requires_extrusion(&self) -> bool {
        use IntegralType::*;
        self.is_horizontal() || matches!(self, ExteriorFacetVert | InteriorFacetVert)
    }
}

impl fmt::Display for IntegralType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Local facet number passed to horizontal facet kernels.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum HorizontalFacet {
    Bottom,
    Top,
}

impl HorizontalFacet {
    pub fn local_index(&self) -> usize {
        match self {
            HorizontalFacet::Bottom => 0,
            HorizontalFacet::Top => 1,
        }
    }
}

/// The data a local kernel receives for one cell.
///
/// `coefficients` holds one buffer per coefficient in the kernel's coefficient map. Mixed
/// coefficients contribute one buffer per component.
#[derive(Debug, Clone, Copy)]
pub struct LocalKernelArgs<'a> {
    pub coordinates: &'a [f64],
    pub cell_orientations: Option<&'a [i32]>,
    pub coefficients: &'a [&'a [f64]],
    pub cell_sizes: Option<&'a [f64]>,
    /// The local facet number for facet integrals.
    pub facet: Option<usize>,
}

/// An externally compiled kernel evaluating one integral on a single cell.
///
/// The kernel accumulates its dense, row-major local tensor into `output`.
pub trait LocalKernel: Send + Sync {
    fn evaluate(&self, output: &mut [f64], args: &LocalKernelArgs);
}

impl<F> LocalKernel for F
where
    F: Fn(&mut [f64], &LocalKernelArgs) + Send + Sync,
{
    fn evaluate(&self, output: &mut [f64], args: &LocalKernelArgs) {
        self(output, args)
    }
}

#[derive(Clone)]
pub struct IntegralKernel {
    pub name: String,
    pub integral_type: IntegralType,
    pub subdomain_id: Option<i64>,
    pub oriented: bool,
    pub needs_cell_sizes: bool,
    /// Indices into the coefficients of the form this kernel belongs to.
    pub coefficient_map: Vec<usize>,
    /// Estimated number of floating point operations for a single invocation.
    pub flops: usize,
    pub kernel: Arc<dyn LocalKernel>,
}

impl IntegralKernel {
    pub fn new(name: impl Into<String>, integral_type: IntegralType, kernel: impl LocalKernel + 'static) -> Self {
        Self {
            name: name.into(),
            integral_type,
            subdomain_id: None,
            oriented: false,
            needs_cell_sizes: false,
            coefficient_map: Vec::new(),
            flops: 0,
            kernel: Arc::new(kernel),
        }
    }

    pub fn with_subdomain(mut self, subdomain_id: i64) -> Self {
        self.subdomain_id = Some(subdomain_id);
        self
    }

    pub fn with_coefficients(mut self, coefficient_map: impl IntoIterator<Item = usize>) -> Self {
        self.coefficient_map = coefficient_map.into_iter().collect();
        self
    }

    pub fn with_flops(mut self, flops: usize) -> Self {
        self.flops = flops;
        self
    }

    pub fn oriented(mut self) -> Self {
        self.oriented = true;
        self
    }

    pub fn with_cell_sizes(mut self) -> Self {
        self.needs_cell_sizes = true;
        self
    }
}

impl fmt::Debug for IntegralKernel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IntegralKernel")
            .field("name", &self.name)
            .field("integral_type", &self.integral_type)
            .field("subdomain_id", &self.subdomain_id)
            .field("oriented", &self.oriented)
            .field("needs_cell_sizes", &self.needs_cell_sizes)
            .field("coefficient_map", &self.coefficient_map)
            .field("flops", &self.flops)
            .finish_non_exhaustive()
    }
}

/// A variational form together with the local kernels that assemble it.
#[derive(Debug, Clone)]
pub struct Form {
    pub name: String,
    pub domain: DomainId,
    /// One function space per form argument. The number of arguments is the rank.
    pub arguments: Vec<FunctionSpace>,
    pub coefficients: Vec<CoefficientId>,
    pub integrals: Vec<IntegralKernel>,
}

impl Form {
    pub fn new(name: impl Into<String>, domain: DomainId, arguments: Vec<FunctionSpace>) -> Self {
        Self {
            name: name.into(),
            domain,
            arguments,
            coefficients: Vec::new(),
            integrals: Vec::new(),
        }
    }

    pub fn with_coefficients(mut self, coefficients: impl IntoIterator<Item = CoefficientId>) -> Self {
        self.coefficients = coefficients.into_iter().collect();
        self
    }

    pub fn with_integral(mut self, integral: IntegralKernel) -> Self {
        self.integrals.push(integral);
        self
    }

    pub fn rank(&self) -> usize {
        self.arguments.len()
    }
}
