use crate::space::{ElementLayout, FiniteElement};
use ::proptest::collection::vec;
use ::proptest::prelude::*;

/// Element layouts small enough to keep generated kernels cheap to execute.
pub fn element_layout() -> impl Strategy<Value = ElementLayout> {
    (1usize..=6, 1usize..=3).prop_map(|(nodes, dofs)| ElementLayout::new(nodes, dofs))
}

/// Mixed elements with between 1 and `max_components` components.
pub fn mixed_element(max_components: usize) -> impl Strategy<Value = FiniteElement> {
    vec(element_layout(), 1..=max_components.max(1)).prop_map(FiniteElement::Mixed)
}

/// Square matrices that are diagonally dominant, and therefore comfortably invertible.
pub fn invertible_matrix(max_dim: usize) -> impl Strategy<Value = (usize, Vec<f64>)> {
    (1..=max_dim.max(1)).prop_flat_map(|n| {
        vec(-1.0..1.0, n * n).prop_map(move |mut entries| {
            for i in 0..n {
                entries[n * i + i] += 2.0 * n as f64;
            }
            (n, entries)
        })
    })
}

impl Arbitrary for ElementLayout {
    type Parameters = ();
    type Strategy = BoxedStrategy<Self>;

    fn arbitrary_with(_args: Self::Parameters) -> Self::Strategy {
        element_layout().boxed()
    }
}
