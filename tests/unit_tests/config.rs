use slac::{CompileError, CompilerParameters, ExternalLibraries};
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

fn write_petscvariables(root: &std::path::Path, contents: &str) {
    let conf = root.join("lib/petsc/conf");
    fs::create_dir_all(&conf).expect("Failed to create PETSc configuration directory");
    fs::write(conf.join("petscvariables"), contents).expect("Failed to write petscvariables");
}

#[test]
fn libraries_are_read_from_the_petsc_arch() {
    let dir = TempDir::new().expect("Failed to create temporary directory");
    write_petscvariables(
        &dir.path().join("arch-linux-c-opt"),
        "PETSC_CC_INCLUDES = -I/petsc/include -I/petsc/arch-linux-c-opt/include\n\
         BLASLAPACK_LIB = -L/usr/lib -lopenblas\n",
    );

    let libraries = ExternalLibraries::from_petsc(dir.path(), Some("arch-linux-c-opt")).unwrap();
    assert_eq!(
        libraries.include_dirs,
        vec![
            PathBuf::from("/petsc/include"),
            PathBuf::from("/petsc/arch-linux-c-opt/include")
        ]
    );
    assert_eq!(libraries.ldargs, vec!["-L/usr/lib", "-lopenblas"]);

    // Without an arch, the installation root is used
    assert!(matches!(
        ExternalLibraries::from_petsc(dir.path(), None),
        Err(CompileError::Configuration(_))
    ));
}

#[test]
fn configuration_without_lapack_is_rejected() {
    let dir = TempDir::new().expect("Failed to create temporary directory");
    write_petscvariables(dir.path(), "PETSC_CC_INCLUDES = -I/petsc/include\n");
    let result = ExternalLibraries::from_petsc(dir.path(), None);
    assert!(matches!(result, Err(CompileError::Configuration(msg)) if msg.contains("LAPACK")));
}

#[test]
fn default_parameters() {
    let parameters = CompilerParameters::default();
    assert_eq!(parameters.get("mode"), Some("spectral"));
    assert_eq!(parameters.precision(), Ok(12));
    assert_eq!(parameters.scalar_type(), Ok("double"));
    assert_eq!(
        parameters.to_string(),
        "[('mode', 'spectral'), ('precision', '12'), ('scalar_type', 'double')]"
    );
    assert_eq!(CompilerParameters::empty().precision(), Ok(12));
    assert!(matches!(
        parameters.with("precision", "-3").precision(),
        Err(CompileError::InvalidParameter { .. })
    ));
}
