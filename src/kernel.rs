/// Kernel sources and the compiled-kernel cache.
/// A kernel is the timed multiply-accumulate loop for one operand type
/// triple. Types, instruction counts and the subgroup width are baked in at
/// GLSL->SPIR-V compile time through macro definitions; tile sizes are left
/// to specialization constants so one compiled kernel serves every tile
/// shape of its type triple.
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, info, warn};

use crate::error::{BenchError, Result};
use crate::gpu::DeviceId;
use crate::variant::{ComponentType, EligibleVariant};

/// Default kernel template, embedded at build time.
pub const COOPMAT_TEMPLATE: &str = include_str!("../shaders/coopmat.comp.glsl.in");

/// Push-constant iteration count at which the kernel stores accumulators of
/// tiles wider than deep (N > K). The C buffer holds M*K elements per
/// accumulator, so those stores would overrun it; the count is never
/// dispatched, which keeps the store live without executing it.
pub const STORE_SENTINEL_ITERATIONS: u32 = u32::MAX;

/// Placeholder names the template expects as macro definitions.
pub const PLACEHOLDERS: [&str; 6] = [
    "A_TYPE",
    "B_TYPE",
    "C_TYPE",
    "INST_COUNT",
    "BLOCKS_IN_KERNEL",
    "SUBGRP_SIZE",
];

/// Identity of a compiled kernel: tile sizes and scope do not take part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub device: DeviceId,
    pub a_type: ComponentType,
    pub b_type: ComponentType,
    pub c_type: ComponentType,
}

impl CacheKey {
    pub fn new(device: DeviceId, variant: &EligibleVariant) -> Self {
        CacheKey {
            device,
            a_type: variant.a_type,
            b_type: variant.b_type,
            c_type: variant.c_type,
        }
    }
}

/// Compile-time kernel parameters that are not part of the cache key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelParams {
    pub subgroup_size: u32,
    pub insts_in_block: u32,
    pub blocks_in_kernel: u32,
}

/// Template text plus the macro definitions specializing it.
#[derive(Debug, Clone)]
pub struct KernelSource {
    pub name: String,
    pub text: Arc<str>,
    pub defines: Vec<(&'static str, String)>,
}

impl KernelSource {
    pub fn specialize(template: &Arc<str>, key: &CacheKey, params: &KernelParams) -> Self {
        let values = [
            key.a_type.glsl_name().to_string(),
            key.b_type.glsl_name().to_string(),
            key.c_type.glsl_name().to_string(),
            params.insts_in_block.to_string(),
            params.blocks_in_kernel.to_string(),
            params.subgroup_size.to_string(),
        ];
        KernelSource {
            name: format!("coopmat_{}_{}_{}", key.a_type, key.b_type, key.c_type),
            text: Arc::clone(template),
            defines: PLACEHOLDERS.into_iter().zip(values).collect(),
        }
    }
}

/// GLSL -> SPIR-V compiler targeting Vulkan 1.3.
pub struct GlslCompiler {
    compiler: shaderc::Compiler,
}

impl GlslCompiler {
    pub fn new() -> Result<Self> {
        let compiler = shaderc::Compiler::new().ok_or_else(|| BenchError::Compile {
            kernel: "<init>".to_string(),
            message: "failed to initialize shaderc".to_string(),
        })?;
        Ok(GlslCompiler { compiler })
    }

    pub fn compile(&self, source: &KernelSource) -> Result<Vec<u32>> {
        let compile_error = |message: String| BenchError::Compile {
            kernel: source.name.clone(),
            message,
        };

        let mut options = shaderc::CompileOptions::new()
            .ok_or_else(|| compile_error("failed to create compile options".to_string()))?;
        for (name, value) in &source.defines {
            options.add_macro_definition(name, Some(value.as_str()));
        }
        options.set_optimization_level(shaderc::OptimizationLevel::Performance);
        options.set_target_env(shaderc::TargetEnv::Vulkan, shaderc::EnvVersion::Vulkan1_3 as u32);

        let artifact = self
            .compiler
            .compile_into_spirv(
                &source.text,
                shaderc::ShaderKind::Compute,
                "coopmat.comp.glsl",
                "main",
                Some(&options),
            )
            .map_err(|e| compile_error(e.to_string()))?;

        if artifact.get_num_warnings() > 0 {
            warn!("{}: {}", source.name, artifact.get_warning_messages());
        }
        Ok(artifact.as_binary().to_vec())
    }
}

/// A compiled kernel shared by every benchmark with the same cache key.
#[derive(Debug)]
pub struct KernelEntry<P> {
    pub program: P,
    pub source: KernelSource,
    pub subgroup_size: u32,
}

pub type KernelHandle<P> = Arc<KernelEntry<P>>;

type Slot<P> = Arc<Mutex<Option<KernelHandle<P>>>>;

/// Compile-once store of kernels keyed by device and operand types.
///
/// Each key owns its own lock, so concurrent callers asking for the same key
/// wait for the one compilation in flight while other keys proceed. Programs
/// are never destroyed by dropping handles; [`KernelCache::release_all`]
/// hands each one back exactly once.
pub struct KernelCache<P> {
    slots: Mutex<HashMap<CacheKey, Slot<P>>>,
    compiles: AtomicUsize,
}

impl<P> Default for KernelCache<P> {
    fn default() -> Self {
        KernelCache {
            slots: Mutex::new(HashMap::new()),
            compiles: AtomicUsize::new(0),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<P> KernelCache<P> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached kernel for `key`, building it with `build` on a miss.
    /// A build error is returned as-is and leaves the key uncached.
    pub fn get_or_compile<F>(
        &self,
        key: CacheKey,
        params: KernelParams,
        template: &Arc<str>,
        build: F,
    ) -> Result<KernelHandle<P>>
    where
        F: FnOnce(&KernelSource) -> Result<P>,
    {
        let slot = Arc::clone(lock(&self.slots).entry(key).or_default());
        let mut slot = lock(&slot);

        if let Some(entry) = slot.as_ref() {
            debug!("kernel cache hit: {} on {}", entry.source.name, key.device);
            return Ok(Arc::clone(entry));
        }

        let source = KernelSource::specialize(template, &key, &params);
        info!(
            "compiling GLSL->SPIR-V for {}, {}, {} (subgroup size {})",
            key.a_type, key.b_type, key.c_type, params.subgroup_size
        );
        let program = build(&source)?;
        self.compiles.fetch_add(1, Ordering::Relaxed);

        let entry = Arc::new(KernelEntry {
            program,
            source,
            subgroup_size: params.subgroup_size,
        });
        *slot = Some(Arc::clone(&entry));
        Ok(entry)
    }

    /// Number of successful compilations performed so far.
    pub fn compile_count(&self) -> usize {
        self.compiles.load(Ordering::Relaxed)
    }

    /// Number of compiled kernels currently held.
    pub fn len(&self) -> usize {
        lock(&self.slots)
            .values()
            .filter(|slot| lock(slot).is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty the cache and pass every program to `destroy` exactly once.
    /// Entries still referenced by a benchmark are leaked rather than
    /// destroyed under their holder. Returns the number destroyed.
    pub fn release_all<F>(&self, mut destroy: F) -> usize
    where
        F: FnMut(CacheKey, P),
    {
        let drained: Vec<(CacheKey, Slot<P>)> = lock(&self.slots).drain().collect();
        let mut released = 0;
        for (key, slot) in drained {
            let Some(entry) = lock(&slot).take() else {
                continue;
            };
            match Arc::try_unwrap(entry) {
                Ok(entry) => {
                    debug!("destroying kernel {} on {}", entry.source.name, key.device);
                    destroy(key, entry.program);
                    released += 1;
                }
                Err(entry) => warn!(
                    "kernel {} on {} still in use at release ({} holders), leaking it",
                    entry.source.name,
                    key.device,
                    Arc::strong_count(&entry) - 1
                ),
            }
        }
        released
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn key(device: usize, a: ComponentType, c: ComponentType) -> CacheKey {
        CacheKey {
            device: DeviceId(device),
            a_type: a,
            b_type: a,
            c_type: c,
        }
    }

    const PARAMS: KernelParams = KernelParams {
        subgroup_size: 32,
        insts_in_block: 8,
        blocks_in_kernel: 4,
    };

    fn template() -> Arc<str> {
        Arc::from(COOPMAT_TEMPLATE)
    }

    #[test]
    fn specialization_defines_every_placeholder() {
        let src = KernelSource::specialize(
            &template(),
            &key(0, ComponentType::S8, ComponentType::S32),
            &PARAMS,
        );
        let defines: HashMap<_, _> =
            src.defines.iter().map(|(n, v)| (*n, v.as_str())).collect();
        assert_eq!(defines.len(), PLACEHOLDERS.len());
        assert_eq!(defines["A_TYPE"], "int8_t");
        assert_eq!(defines["B_TYPE"], "int8_t");
        assert_eq!(defines["C_TYPE"], "int32_t");
        assert_eq!(defines["INST_COUNT"], "8");
        assert_eq!(defines["BLOCKS_IN_KERNEL"], "4");
        assert_eq!(defines["SUBGRP_SIZE"], "32");
        assert_eq!(src.name, "coopmat_s8_s8_s32");
    }

    #[test]
    fn template_uses_every_placeholder() {
        for name in PLACEHOLDERS {
            assert!(COOPMAT_TEMPLATE.contains(name), "template never uses {name}");
        }
    }

    #[test]
    fn wide_tile_stores_sit_behind_the_sentinel() {
        let guard = format!("pc.iterations == {STORE_SENTINEL_ITERATIONS:#X}u");
        assert_eq!(guard, "pc.iterations == 0xFFFFFFFFu");
        let line = COOPMAT_TEMPLATE
            .lines()
            .find(|l| l.contains(&guard))
            .expect("store guard missing");
        assert!(line.contains("N <= K ||"));
        let guard_at = COOPMAT_TEMPLATE.find(&guard).unwrap();
        let store_at = COOPMAT_TEMPLATE.find("coopMatStore").unwrap();
        assert!(guard_at < store_at);
    }

    #[test]
    fn second_lookup_reuses_the_program() {
        let cache = KernelCache::new();
        let builds = AtomicU32::new(0);
        let build = |_: &KernelSource| Ok(builds.fetch_add(1, Ordering::SeqCst) + 100);
        let k = key(0, ComponentType::F16, ComponentType::F16);

        let first = cache.get_or_compile(k, PARAMS, &template(), build).unwrap();
        let second = cache.get_or_compile(k, PARAMS, &template(), build).unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.program, 100);
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert_eq!(cache.compile_count(), 1);
    }

    #[test]
    fn distinct_devices_compile_separately() {
        let cache = KernelCache::new();
        let t = template();
        cache
            .get_or_compile(key(0, ComponentType::F16, ComponentType::F32), PARAMS, &t, |_| Ok(1))
            .unwrap();
        cache
            .get_or_compile(key(1, ComponentType::F16, ComponentType::F32), PARAMS, &t, |_| Ok(2))
            .unwrap();
        assert_eq!(cache.compile_count(), 2);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn failed_build_is_not_cached() {
        let cache: KernelCache<u32> = KernelCache::new();
        let k = key(0, ComponentType::F32, ComponentType::F32);
        let err = cache
            .get_or_compile(k, PARAMS, &template(), |src| {
                Err(BenchError::Compile {
                    kernel: src.name.clone(),
                    message: "syntax error".into(),
                })
            })
            .unwrap_err();
        assert!(matches!(err, BenchError::Compile { .. }));
        assert!(cache.is_empty());
        assert_eq!(cache.compile_count(), 0);
    }

    #[test]
    fn release_all_destroys_each_program_once() {
        let cache = KernelCache::new();
        let t = template();
        for (i, c) in [ComponentType::F16, ComponentType::F32].into_iter().enumerate() {
            cache
                .get_or_compile(key(0, ComponentType::F16, c), PARAMS, &t, |_| Ok(i))
                .unwrap();
        }
        let mut destroyed = Vec::new();
        let released = cache.release_all(|_, program| destroyed.push(program));
        destroyed.sort();
        assert_eq!(released, 2);
        assert_eq!(destroyed, vec![0, 1]);
        assert!(cache.is_empty());
        assert_eq!(cache.release_all(|_, _: usize| panic!("double destroy")), 0);
    }

    #[test]
    fn release_all_skips_entries_still_held() {
        let cache = KernelCache::new();
        let k = key(0, ComponentType::U8, ComponentType::U32);
        let held = cache.get_or_compile(k, PARAMS, &template(), |_| Ok(7u8)).unwrap();
        let released = cache.release_all(|_, _| panic!("destroyed while held"));
        assert_eq!(released, 0);
        assert_eq!(held.program, 7);
    }
}
