//! Layout of coefficient data packed into vector temporaries.
//!
//! Coefficients are passed to the kernel with one buffer per component space. A coefficient
//! on a mixed space therefore arrives as several buffers, which have to be packed into
//! a single contiguous temporary. The components are laid out one after another, so component
//! `k` starts at the sum of the extents of components `0..k`.
//!
//! Components with identical node and dof extents are grouped, so that a single double loop
//! (nodes outer, dofs inner) copies all of them:
//!
//! ```text
//! for i in 0..node_extent {
//!     for j in 0..dof_extent {
//!         VT0[offset0 + dof_extent * i + j] = w_0_0[dof_extent * i + j];
//!         VT1[offset1 + dof_extent * i + j] = w_1[dof_extent * i + j];
//!     }
//! }
//! ```
use crate::expression::{ExpressionDag, NodeId, TensorKind};
use crate::planner::ExpressionPlan;
use crate::space::{CoefficientId, ElementLayout};
use log::debug;

/// Packing information for one component of an assembled coefficient vector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoefficientInfo {
    /// Index of the component within a mixed space, 0 if the space is not mixed.
    pub space_index: usize,
    /// Offset of the component in the packed temporary.
    pub offset_index: usize,
    pub shape: ElementLayout,
    /// The assembled vector terminal this component belongs to.
    pub vector: NodeId,
    pub coefficient: CoefficientId,
    /// Name of the temporary the vector is packed into.
    pub local_temp: String,
}

/// Components sharing the same node and dof extents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoefficientGroup {
    pub extents: ElementLayout,
    pub members: Vec<CoefficientInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoefficientLayout {
    groups: Vec<CoefficientGroup>,
}

impl CoefficientLayout {
    /// Groups in order of first appearance.
    pub fn groups(&self) -> &[CoefficientGroup] {
        &self.groups
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    pub fn components(&self) -> impl Iterator<Item = &CoefficientInfo> {
        self.groups.iter().flat_map(|group| group.members.iter())
    }

    fn insert(&mut self, info: CoefficientInfo) {
        match self
            .groups
            .iter_mut()
            .find(|group| group.extents == info.shape)
        {
            Some(group) => group.members.push(info),
            None => self.groups.push(CoefficientGroup {
                extents: info.shape,
                members: vec![info],
            }),
        }
    }
}

/// Splits a (possibly mixed) element into components with cumulative offsets.
pub fn component_offsets(components: &[ElementLayout]) -> Vec<(usize, ElementLayout)> {
    components
        .iter()
        .scan(0, |offset, layout| {
            let component_offset = *offset;
            *offset += layout.extent();
            Some((component_offset, *layout))
        })
        .collect()
}

/// Computes the packing layout of every assembled vector in the plan.
pub fn resolve_coefficients(dag: &ExpressionDag, plan: &ExpressionPlan) -> CoefficientLayout {
    let mut layout = CoefficientLayout::default();
    for &id in &plan.order {
        let coefficient = match dag.node(id).kind() {
            TensorKind::AssembledVector(coefficient) => *coefficient,
            _ => continue,
        };
        let temporary = plan
            .temporaries
            .get(id)
            .expect("Internal error: assembled vectors always have a temporary");
        let element = &dag.coefficient(coefficient).space.element;
        for (space_index, (offset_index, shape)) in component_offsets(element.components())
            .into_iter()
            .enumerate()
        {
            layout.insert(CoefficientInfo {
                space_index,
                offset_index,
                shape,
                vector: id,
                coefficient,
                local_temp: temporary.name.clone(),
            });
        }
    }

    for group in layout.groups() {
        debug!(
            "Coefficient group with {} nodes x {} dofs: {:?}",
            group.extents.node_extent,
            group.extents.dof_extent,
            group
                .members
                .iter()
                .map(|info| (&info.local_temp, info.offset_index))
                .collect::<Vec<_>>()
        );
    }
    layout
}
