//! Built-in test cases.

use std::path::PathBuf;

use crate::launcher::{Parallelism, RunRequest};
use crate::matrix::{ClassRule, Classifier, Matcher};
use crate::plan::{Analysis, CatalogueSource, ExplicitBuild, PreparePlan, TestCase};
use crate::validator::{RuleSet, ToleranceRule};
use crate::variant::{BuildVariant, CapabilityFlag, Precision};

const JEANS_INPUT: &str = "hydro/athinput.jeans_3d";
const JEANS_REPORT: &str = "jeans-errors.dat";
const JEANS_ARGS: &[&str] = &[
    "time/ncycle_out=10",
    "mesh/nx1=64",
    "mesh/nx2=32",
    "mesh/nx3=32",
    "meshblock/nx1=16",
    "meshblock/nx2=16",
    "meshblock/nx3=16",
    "output2/dt=-1",
    "time/tlim=1.0",
    "problem/compute_error=true",
];

/// Problem generators that need a magnetic field.
const MHD_PROBLEMS: &[&str] = &[
    "hb3",
    "hgb",
    "jgg",
    "cpaw",
    "field_loop",
    "orszag_tang",
    "rotor",
    "resist",
    "magnoh",
];

/// Every case shipped with the harness, in execution order.
pub fn builtin_cases() -> Vec<TestCase> {
    vec![jeans_3d(), pgen_compile()]
}

pub fn find_case(name: &str) -> Option<TestCase> {
    builtin_cases().into_iter().find(|c| c.name == name)
}

/// Self-gravity Jeans wave in 3D.
///
/// Multigrid and FFT gravity are each built serial and distributed. The
/// error of a one-process distributed run must equal its serial twin
/// bit-for-bit; 2 and 4 processes may drift by at most 5e-4.
pub fn jeans_3d() -> TestCase {
    let jeans = |id: &str| BuildVariant::new(id, "jeans");
    let mpi = CapabilityFlag::switch("mpi");
    let fft = CapabilityFlag::switch("fft");
    let grav_fft = CapabilityFlag::option("grav", "fft");
    let grav_mg = CapabilityFlag::option("grav", "mg");

    let variants = vec![
        ExplicitBuild {
            variant: jeans("mpi_fft").with_flags([mpi.clone(), fft.clone(), grav_fft.clone()]),
            preserve: true,
        },
        ExplicitBuild {
            variant: jeans("mpi_mg").with_flags([mpi, grav_mg.clone()]),
            preserve: true,
        },
        ExplicitBuild {
            variant: jeans("fft").with_flags([fft, grav_fft]),
            preserve: true,
        },
        ExplicitBuild {
            variant: jeans("mg").with_flag(grav_mg),
            preserve: false,
        },
    ];

    let run = |variant: &str, parallelism: Parallelism, coverage: Option<&str>| RunRequest {
        variant: variant.to_string(),
        input: PathBuf::from(JEANS_INPUT),
        args: JEANS_ARGS.iter().map(|a| a.to_string()).collect(),
        parallelism,
        coverage_tag: coverage.map(str::to_string),
    };
    let runs = vec![
        run("mg", Parallelism::Serial, Some("mg")),
        run("fft", Parallelism::Serial, Some("fft")),
        run("mpi_mg", Parallelism::Distributed(1), None),
        run("mpi_mg", Parallelism::Distributed(2), None),
        run("mpi_mg", Parallelism::Distributed(4), Some("mpi_mg")),
        run("mpi_fft", Parallelism::Distributed(1), None),
        run("mpi_fft", Parallelism::Distributed(2), None),
        run("mpi_fft", Parallelism::Distributed(4), Some("mpi_fft")),
    ];

    // Rows follow the run order: 0 mg, 1 fft, 2..=4 mpi_mg, 5..=7 mpi_fft.
    let rules = RuleSet::new(4)
        .with_rule(ToleranceRule::exact(
            0,
            2,
            "Linear wave error with one core w/wo MPI not identical for MG gravity",
        ))
        .with_rule(ToleranceRule::absolute(
            0,
            1e-7,
            "Linear wave error is too large for MG gravity",
        ))
        .with_rule(ToleranceRule::absolute(
            1,
            1e-7,
            "Linear wave error is too large for FFT gravity",
        ))
        .with_rule(ToleranceRule::exact(
            1,
            5,
            "Linear wave error with one core w/wo MPI not identical for FFT gravity",
        ))
        .with_rule(ToleranceRule::relative(
            3,
            2,
            5e-4,
            "Linear wave error between 2 and 1 cores too large for MG gravity",
        ))
        .with_rule(ToleranceRule::relative(
            4,
            2,
            5e-4,
            "Linear wave error between 4 and 1 cores too large for MG gravity",
        ))
        .with_rule(ToleranceRule::relative(
            6,
            5,
            5e-4,
            "Linear wave error between 2 and 1 cores too large for FFT gravity",
        ))
        .with_rule(ToleranceRule::relative(
            7,
            5,
            5e-4,
            "Linear wave error between 4 and 1 cores too large for FFT gravity",
        ));

    TestCase {
        name: "jeans_3d".to_string(),
        description: "Jeans wave with MG and FFT self-gravity, serial vs distributed".to_string(),
        prepare: PreparePlan::Explicit {
            variants,
            exclude: vec![],
        },
        runs,
        coverage_exempt: true,
        analysis: Some(Analysis {
            report: PathBuf::from(JEANS_REPORT),
            rules,
            expected_rows: Some(8),
            audit: false,
            allow_nan: false,
        }),
    }
}

/// Compile every problem generator in `src/pgen`, in single and double precision.
pub fn pgen_compile() -> TestCase {
    let classifier = Classifier::default()
        .with_rule(ClassRule::new(
            "gr",
            Matcher::Prefix {
                prefix: "gr_".to_string(),
            },
            vec![
                CapabilityFlag::switch("g"),
                CapabilityFlag::switch("t"),
                CapabilityFlag::option("coord", "minkowski"),
            ],
        ))
        .with_rule(ClassRule::new(
            "mhd",
            Matcher::Members {
                members: MHD_PROBLEMS.iter().map(|p| p.to_string()).collect(),
            },
            vec![CapabilityFlag::switch("b")],
        ))
        .with_rule(ClassRule::new("hydro", Matcher::Any, vec![]));

    TestCase {
        name: "pgen_compile".to_string(),
        description: "Every problem generator compiles in single and double precision"
            .to_string(),
        prepare: PreparePlan::Sweep {
            catalogue: CatalogueSource::Directory {
                dir: PathBuf::from("src/pgen"),
                extension: "cpp".to_string(),
            },
            classifier,
            exclude: vec!["default_pgen".to_string(), "from_array".to_string()],
            shared_flags: vec![CapabilityFlag::switch("f")],
            precisions: vec![Precision::Single, Precision::Double],
        },
        runs: vec![],
        coverage_exempt: false,
        analysis: None,
    }
}
