use std::path::PathBuf;

use coopmat_bench::capability::filter;
use coopmat_bench::config::{BenchConfig, SubgroupSizePolicy};
use coopmat_bench::gpu::DeviceId;
use coopmat_bench::metrics::{BenchReport, DeviceReport, VariantReport};
use coopmat_bench::stats::{reduce, OpKind};
use coopmat_bench::variant::{ComponentType, Scope, Tile, VariantDescriptor};

fn scratch(name: &str) -> PathBuf {
    std::env::temp_dir().join(format!("coopmat_{}_{}", std::process::id(), name))
}

#[test]
fn config_file_overrides_only_given_fields() {
    let path = scratch("config.json");
    std::fs::write(
        &path,
        r#"{ "outer_iterations": 3, "subgroup_size": "max", "template": "k.glsl" }"#,
    )
    .unwrap();
    let config = BenchConfig::from_file(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(config.outer_iterations, 3);
    assert_eq!(config.subgroup_size, SubgroupSizePolicy::Max);
    assert_eq!(config.template, Some(PathBuf::from("k.glsl")));
    assert_eq!(config.inner_iterations, BenchConfig::default().inner_iterations);
    assert!(config.validate().is_ok());
}

#[test]
fn invalid_values_are_rejected() {
    for broken in [
        BenchConfig { num_groups: 0, ..BenchConfig::default() },
        BenchConfig { insts_in_block: 0, ..BenchConfig::default() },
        BenchConfig { outer_iterations: u32::MAX, ..BenchConfig::default() },
    ] {
        assert!(broken.validate().is_err(), "{broken:?} accepted");
    }
}

#[test]
fn malformed_config_file_is_an_error() {
    let path = scratch("broken.json");
    std::fs::write(&path, "{ not json").unwrap();
    let result = BenchConfig::from_file(&path);
    std::fs::remove_file(&path).unwrap();
    assert!(result.is_err());
}

#[test]
fn report_keeps_results_and_skips() {
    let good = VariantDescriptor::new(
        Tile::new(16, 16, 16),
        ComponentType::F16,
        ComponentType::F16,
        ComponentType::F32,
        ComponentType::F32,
        Scope::Subgroup,
    );
    let bad = VariantDescriptor { scope: Scope::Workgroup as i32, ..good };
    let outcome = filter(&[good, bad], 32);

    let result = reduce(&[0, 100, 100, 300], 1.0, 100_000, OpKind::Float).unwrap();
    let mut report = BenchReport::new(BenchConfig::smoke());
    report.devices.push(DeviceReport {
        id: DeviceId(0),
        name: "Test GPU".into(),
        device_type: "Discrete GPU".into(),
        driver: "test 1.0.0".into(),
        subgroup_size: 32,
        timestamp_period_ns: 1.0,
        advertised: 2,
        results: vec![VariantReport {
            device: DeviceId(0),
            descriptor: outcome.eligible[0].descriptor,
            subgroup_size: 32,
            result,
            wait_retries: 0,
        }],
        skipped: outcome.skipped,
    });

    let path = scratch("report.json");
    report.write(&path).unwrap();
    let back = BenchReport::read(&path).unwrap();
    std::fs::remove_file(&path).unwrap();

    assert_eq!(back, report);
    assert_eq!(back.results().count(), 1);
    assert_eq!(back.devices[0].skipped.len(), 1);
    assert_eq!(back.results().next().unwrap().result.mean_ticks, 150);
}
