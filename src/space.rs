//! Function space and mesh metadata consumed by the compiler.
//!
//! The compiler never looks at a mesh. It only needs to know how many nodes and
//! degrees of freedom per node each function space has on a single cell, how many
//! facets a cell has and whether the mesh is extruded.
use crate::error::CompileError;
use serde::{Deserialize, Serialize};

/// The local layout of a (non-mixed) finite element on a single cell.
///
/// `dof_extent` is the number of degrees of freedom per node, e.g. the value size
/// of a vector-valued element.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementLayout {
    pub node_extent: usize,
    pub dof_extent: usize,
}

impl ElementLayout {
    pub fn new(node_extent: usize, dof_extent: usize) -> Self {
        Self { node_extent, dof_extent }
    }

    pub fn scalar(node_extent: usize) -> Self {
        Self::new(node_extent, 1)
    }

    /// Total number of local degrees of freedom.
    pub fn extent(&self) -> usize {
        self.node_extent * self.dof_extent
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FiniteElement {
    Simple(ElementLayout),
    /// A mixed element built from several component elements.
    Mixed(Vec<ElementLayout>),
}

impl FiniteElement {
    pub fn is_mixed(&self) -> bool {
        matches!(self, FiniteElement::Mixed(_))
    }

    /// The component layouts. A simple element has exactly one component.
    pub fn components(&self) -> &[ElementLayout] {
        match self {
            FiniteElement::Simple(layout) => std::slice::from_ref(layout),
            FiniteElement::Mixed(layouts) => layouts,
        }
    }

    /// Number of local degrees of freedom of each component.
    pub fn component_extents(&self) -> Vec<usize> {
        self.components().iter().map(ElementLayout::extent).collect()
    }

    pub fn dimension(&self) -> usize {
        self.components().iter().map(ElementLayout::extent).sum()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CellTopology {
    pub num_facets: usize,
}

impl CellTopology {
    pub fn interval() -> Self {
        Self { num_facets: 2 }
    }

    pub fn triangle() -> Self {
        Self { num_facets: 3 }
    }

    pub fn quadrilateral() -> Self {
        Self { num_facets: 4 }
    }

    pub fn tetrahedron() -> Self {
        Self { num_facets: 4 }
    }

    pub fn hexahedron() -> Self {
        Self { num_facets: 6 }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainId(pub usize);

/// A mesh domain as seen from a single cell.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Domain {
    /// The cell topology. For extruded meshes this is the base cell.
    pub cell: CellTopology,
    /// Number of cell layers if the mesh is extruded.
    pub layers: Option<usize>,
    /// Layout of the coordinate field on one cell.
    pub coordinates: ElementLayout,
}

impl Domain {
    pub fn new(cell: CellTopology, coordinates: ElementLayout) -> Self {
        Self {
            cell,
            layers: None,
            coordinates,
        }
    }

    /// An extruded domain with `layers` cell layers on top of `base_cell`.
    ///
    /// An extruded mesh has at least one layer.
    pub fn extruded(base_cell: CellTopology, coordinates: ElementLayout, layers: usize) -> Result<Self, CompileError> {
        if layers == 0 {
            return Err(CompileError::InvalidDomain(
                "extruded domains need at least one layer".to_string(),
            ));
        }
        Ok(Self {
            cell: base_cell,
            layers: Some(layers),
            coordinates,
        })
    }

    pub fn is_extruded(&self) -> bool {
        self.layers.is_some()
    }

    /// Number of facets visited by the facet loop of a kernel.
    pub fn num_facets(&self) -> usize {
        self.cell.num_facets
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FunctionSpace {
    pub domain: DomainId,
    pub element: FiniteElement,
}

impl FunctionSpace {
    pub fn new(domain: DomainId, element: FiniteElement) -> Self {
        Self { domain, element }
    }

    pub fn simple(domain: DomainId, node_extent: usize, dof_extent: usize) -> Self {
        Self::new(domain, FiniteElement::Simple(ElementLayout::new(node_extent, dof_extent)))
    }

    pub fn mixed(domain: DomainId, components: impl IntoIterator<Item = ElementLayout>) -> Self {
        Self::new(domain, FiniteElement::Mixed(components.into_iter().collect()))
    }

    pub fn dimension(&self) -> usize {
        self.element.dimension()
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CoefficientId(pub usize);

/// A function whose local values are passed to the kernel as arguments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Coefficient {
    pub name: String,
    pub space: FunctionSpace,
}
