//! Compiled kernels and the arguments they are invoked with.
use crate::cache::CacheKey;
use crate::config::ExternalLibraries;
use crate::form::{IntegralKernel, IntegralType};
use crate::generate::GeneratedBody;
use crate::loops::{BufferRole, KernelBody};
use crate::space::Domain;
use crate::{emit, execute};
use serde::{Deserialize, Serialize};

/// Name of every compiled kernel function.
pub const KERNEL_NAME: &str = "compile_slate";

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArgumentRole {
    Output,
    Coordinates,
    CellOrientations,
    /// A coefficient buffer. `component` is set for the components of mixed coefficients.
    Coefficient { index: usize, component: Option<usize> },
    CellSizes,
    CellFacets,
    Layer,
}

/// A formal argument of a compiled kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelArgument {
    pub name: String,
    pub role: ArgumentRole,
    /// C type of a single entry.
    pub dtype: String,
    /// Number of entries the kernel reads or writes.
    pub extent: usize,
}

impl KernelArgument {
    fn new(name: impl Into<String>, role: ArgumentRole, dtype: &str, extent: usize) -> Self {
        Self {
            name: name.into(),
            role,
            dtype: dtype.to_string(),
            extent,
        }
    }
}

/// Metadata describing how a compiled kernel is to be called.
///
/// Compiled expressions always act as cell integrals, even when they loop over facets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelInfo {
    pub integral_type: IntegralType,
    pub oriented: bool,
    pub subdomain_id: String,
    pub domain_number: usize,
    pub coefficient_map: Vec<usize>,
    pub needs_cell_facets: bool,
    pub needs_mesh_layers: bool,
    pub needs_cell_sizes: bool,
}

/// The arguments for one invocation of a compiled kernel.
///
/// `coefficients` holds one buffer per coefficient argument, in argument order, so mixed
/// coefficients contribute one buffer per component.
#[derive(Debug)]
pub struct KernelArguments<'a> {
    pub output: &'a mut [f64],
    pub coordinates: &'a [f64],
    pub cell_orientations: Option<&'a [i32]>,
    pub coefficients: Vec<&'a [f64]>,
    pub cell_sizes: Option<&'a [f64]>,
    /// Per local facet: `[exterior (0) or interior (1), subdomain id]`.
    pub cell_facets: Option<&'a [[i8; 2]]>,
    pub layer: Option<i32>,
}

impl<'a> KernelArguments<'a> {
    pub fn new(output: &'a mut [f64], coordinates: &'a [f64]) -> Self {
        Self {
            output,
            coordinates,
            cell_orientations: None,
            coefficients: Vec::new(),
            cell_sizes: None,
            cell_facets: None,
            layer: None,
        }
    }

    pub fn with_coefficients(mut self, coefficients: impl IntoIterator<Item = &'a [f64]>) -> Self {
        self.coefficients = coefficients.into_iter().collect();
        self
    }

    pub fn with_cell_orientations(mut self, cell_orientations: &'a [i32]) -> Self {
        self.cell_orientations = Some(cell_orientations);
        self
    }

    pub fn with_cell_sizes(mut self, cell_sizes: &'a [f64]) -> Self {
        self.cell_sizes = Some(cell_sizes);
        self
    }

    pub fn with_cell_facets(mut self, cell_facets: &'a [[i8; 2]]) -> Self {
        self.cell_facets = Some(cell_facets);
        self
    }

    pub fn with_layer(mut self, layer: i32) -> Self {
        self.layer = Some(layer);
        self
    }
}

/// A compiled expression, ready to be invoked once per cell.
#[derive(Debug, Clone)]
pub struct CompiledKernel {
    pub name: String,
    pub body: KernelBody,
    pub info: KernelInfo,
    /// Block index of the kernel, zero along every axis of the expression.
    pub index: Vec<usize>,
    pub arguments: Vec<KernelArgument>,
    pub coefficient_count: usize,
    pub estimated_flops: usize,
    pub cache_key: CacheKey,
    pub libraries: ExternalLibraries,
    pub(crate) integrals: Vec<IntegralKernel>,
    pub(crate) precision: usize,
}

impl CompiledKernel {
    /// Binds the generated body to its argument list and metadata.
    pub(crate) fn assemble(
        generated: GeneratedBody,
        domain: &Domain,
        rank: usize,
        expression_flops: usize,
        cache_key: CacheKey,
        libraries: ExternalLibraries,
        precision: usize,
    ) -> Self {
        let GeneratedBody {
            body,
            integrals,
            coefficients,
            oriented,
            needs_cell_sizes,
            needs_cell_facets,
            needs_mesh_layers,
            num_facets,
            terminal_flops,
        } = generated;

        let mut arguments = Vec::new();
        for buffer in body.buffers.iter() {
            if let BufferRole::Output = buffer.role {
                arguments.push(KernelArgument::new(&buffer.name, ArgumentRole::Output, "double", buffer.len()));
            }
        }
        arguments.push(KernelArgument::new(
            "coords",
            ArgumentRole::Coordinates,
            "double",
            domain.coordinates.extent(),
        ));
        if oriented {
            arguments.push(KernelArgument::new(
                "cell_orientations",
                ArgumentRole::CellOrientations,
                "int",
                1,
            ));
        }
        for buffer in body.buffers.iter() {
            if let BufferRole::Coefficient { index, component } = buffer.role {
                arguments.push(KernelArgument::new(
                    &buffer.name,
                    ArgumentRole::Coefficient { index, component },
                    "double",
                    buffer.len(),
                ));
            }
        }
        if needs_cell_sizes {
            arguments.push(KernelArgument::new(
                "cell_sizes",
                ArgumentRole::CellSizes,
                "double",
                domain.coordinates.node_extent,
            ));
        }
        if needs_cell_facets {
            arguments.push(KernelArgument::new(
                "arg_cell_facets",
                ArgumentRole::CellFacets,
                "int8_t",
                2 * num_facets,
            ));
        }
        // The layer always comes last
        if needs_mesh_layers {
            arguments.push(KernelArgument::new("layer", ArgumentRole::Layer, "int", 1));
        }

        let info = KernelInfo {
            integral_type: IntegralType::Cell,
            oriented,
            subdomain_id: "otherwise".to_string(),
            domain_number: 0,
            coefficient_map: (0..coefficients.len()).collect(),
            needs_cell_facets,
            needs_mesh_layers,
            needs_cell_sizes,
        };

        Self {
            name: KERNEL_NAME.to_string(),
            body,
            info,
            index: vec![0; rank],
            arguments,
            coefficient_count: coefficients.len(),
            estimated_flops: expression_flops + terminal_flops,
            cache_key,
            libraries,
            integrals,
            precision,
        }
    }

    /// Runs the kernel on the buffers of a single cell.
    ///
    /// The root expression is added to `args.output`. Failures of the numerical routines are
    /// logged and do not make the invocation fail.
    pub fn invoke(&self, args: KernelArguments) -> eyre::Result<()> {
        let mut workspace = execute::KernelWorkspace::default();
        self.invoke_with_workspace(args, &mut workspace)
    }

    /// Same as [`Self::invoke`], reusing the temporary storage in `workspace`.
    pub fn invoke_with_workspace(
        &self,
        args: KernelArguments,
        workspace: &mut execute::KernelWorkspace,
    ) -> eyre::Result<()> {
        execute::run(self, args, workspace)
    }

    /// Renders the kernel as a C translation unit.
    pub fn c_source(&self) -> String {
        emit::c_source(self)
    }

    pub fn integrals(&self) -> &[IntegralKernel] {
        &self.integrals
    }
}
