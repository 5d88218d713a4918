/// Binding configuration and pipeline specialization.
use ash::vk;
use tracing::debug;

use crate::error::{BenchError, Result};
use crate::kernel::KernelEntry;
use crate::memory::ADDRESS_TABLE_SIZE;
use crate::variant::Tile;

/// Size of the push constant block: the inner iteration count.
pub const PUSH_CONSTANT_SIZE: u32 = std::mem::size_of::<u32>() as u32;

/// Per-device binding layout shared by every pipeline on that device:
/// one uniform buffer binding for the address table and a 4-byte compute
/// push constant.
pub struct DeviceConfiguration {
    device: ash::Device,
    set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    pipeline_layout: vk::PipelineLayout,
}

impl DeviceConfiguration {
    pub fn new(device: &ash::Device) -> Result<Self> {
        let mut config = DeviceConfiguration {
            device: device.clone(),
            set_layout: vk::DescriptorSetLayout::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set: vk::DescriptorSet::null(),
            pipeline_layout: vk::PipelineLayout::null(),
        };

        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::COMPUTE)];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        // SAFETY: valid device and create info.
        config.set_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(BenchError::resource("vkCreateDescriptorSetLayout"))?;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::UNIFORM_BUFFER,
            descriptor_count: 1,
        }];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET)
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        // SAFETY: valid device and create info.
        config.descriptor_pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(BenchError::resource("vkCreateDescriptorPool"))?;

        let set_layouts = [config.set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(config.descriptor_pool)
            .set_layouts(&set_layouts);
        // SAFETY: the pool has room for exactly this one set.
        let sets = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(BenchError::resource("vkAllocateDescriptorSets"))?;
        config.descriptor_set = sets[0];

        let push_constants = [vk::PushConstantRange {
            stage_flags: vk::ShaderStageFlags::COMPUTE,
            offset: 0,
            size: PUSH_CONSTANT_SIZE,
        }];
        let pipeline_layout_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constants);
        // SAFETY: set layout is live.
        config.pipeline_layout =
            unsafe { device.create_pipeline_layout(&pipeline_layout_info, None) }
                .map_err(BenchError::resource("vkCreatePipelineLayout"))?;

        Ok(config)
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor_set
    }

    pub fn pipeline_layout(&self) -> vk::PipelineLayout {
        self.pipeline_layout
    }

    /// Point the single uniform binding at an address table buffer.
    /// Must not be called while a previous submission is still executing.
    pub fn bind_address_table(&self, table: vk::Buffer) {
        let buffer_info = [vk::DescriptorBufferInfo {
            buffer: table,
            offset: 0,
            range: ADDRESS_TABLE_SIZE,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(&buffer_info);
        // SAFETY: the queue is idle between benchmark runs.
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
    }
}

impl Drop for DeviceConfiguration {
    fn drop(&mut self) {
        // SAFETY: no pipeline built from this layout is still alive; the
        // descriptor set is freed together with its pool.
        unsafe {
            if self.pipeline_layout != vk::PipelineLayout::null() {
                self.device.destroy_pipeline_layout(self.pipeline_layout, None);
            }
            if self.descriptor_pool != vk::DescriptorPool::null() {
                self.device.destroy_descriptor_pool(self.descriptor_pool, None);
            }
            if self.set_layout != vk::DescriptorSetLayout::null() {
                self.device.destroy_descriptor_set_layout(self.set_layout, None);
            }
        }
    }
}

/// Specialization constants 0, 1, 2 = M, N, K.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpecializationData {
    data: [u8; 12],
}

impl SpecializationData {
    pub fn new(tile: Tile) -> Self {
        let mut data = [0u8; 12];
        for (chunk, value) in data.chunks_exact_mut(4).zip([tile.m, tile.n, tile.k]) {
            chunk.copy_from_slice(&value.to_ne_bytes());
        }
        SpecializationData { data }
    }

    pub fn map_entries(&self) -> [vk::SpecializationMapEntry; 3] {
        [0u32, 1, 2].map(|id| vk::SpecializationMapEntry {
            constant_id: id,
            offset: id * 4,
            size: 4,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }
}

/// A compute pipeline for one tile shape, destroyed when dropped.
pub struct SpecializedPipeline {
    device: ash::Device,
    pipeline: vk::Pipeline,
}

impl SpecializedPipeline {
    /// Build the pipeline for `tile` from a compiled kernel, requiring full
    /// subgroups of exactly the kernel's subgroup size.
    pub fn build(
        device: &ash::Device,
        config: &DeviceConfiguration,
        kernel: &KernelEntry<vk::ShaderModule>,
        tile: Tile,
    ) -> Result<Self> {
        let spec = SpecializationData::new(tile);
        let entries = spec.map_entries();
        let spec_info = vk::SpecializationInfo::default()
            .map_entries(&entries)
            .data(spec.bytes());

        let mut subgroup = vk::PipelineShaderStageRequiredSubgroupSizeCreateInfo::default()
            .required_subgroup_size(kernel.subgroup_size);
        let stage = vk::PipelineShaderStageCreateInfo::default()
            .flags(vk::PipelineShaderStageCreateFlags::REQUIRE_FULL_SUBGROUPS)
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(kernel.program)
            .name(c"main")
            .specialization_info(&spec_info)
            .push_next(&mut subgroup);
        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(config.pipeline_layout());

        // SAFETY: module and layout are live; create info outlives the call.
        let pipelines = unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
        }
        .map_err(|(_, status)| BenchError::Resource {
            operation: "vkCreateComputePipelines",
            status,
        })?;
        let pipeline = pipelines.into_iter().next().ok_or(BenchError::Resource {
            operation: "vkCreateComputePipelines",
            status: vk::Result::ERROR_UNKNOWN,
        })?;

        debug!(
            "pipeline for {} tile {} (subgroup size {})",
            kernel.source.name, tile, kernel.subgroup_size
        );
        Ok(SpecializedPipeline {
            device: device.clone(),
            pipeline,
        })
    }

    pub fn handle(&self) -> vk::Pipeline {
        self.pipeline
    }
}

impl Drop for SpecializedPipeline {
    fn drop(&mut self) {
        // SAFETY: the run using this pipeline has completed its wait-idle.
        unsafe { self.device.destroy_pipeline(self.pipeline, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn specialization_constants_are_m_n_k_in_order() {
        let spec = SpecializationData::new(Tile::new(16, 8, 32));
        let values: Vec<u32> = spec
            .bytes()
            .chunks_exact(4)
            .map(|c| u32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        assert_eq!(values, vec![16, 8, 32]);

        let entries = spec.map_entries();
        for (i, e) in entries.iter().enumerate() {
            assert_eq!(e.constant_id, i as u32);
            assert_eq!(e.offset, 4 * i as u32);
            assert_eq!(e.size, 4);
        }
    }

    #[test]
    fn push_constant_is_one_u32() {
        assert_eq!(PUSH_CONSTANT_SIZE, 4);
    }
}
