/// Per-benchmark memory: operand buffers and the device-address table.
/// Three regions back one benchmark run:
///   - device-local: A, B and C packed contiguously
///   - host-visible: host shadows of A, B and C, same layout
///   - address table: 3 x 8 bytes holding the device addresses of A, B, C
use ash::vk;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{BenchError, Result};
use crate::gpu::Gpu;
use crate::variant::{EligibleVariant, Tile};

/// Size of the address table: one 64-bit device address per operand.
pub const ADDRESS_TABLE_SIZE: vk::DeviceSize = 3 * 8;

/// Usage flags shared by every buffer the harness creates.
pub fn buffer_usage() -> vk::BufferUsageFlags {
    vk::BufferUsageFlags::STORAGE_BUFFER
        | vk::BufferUsageFlags::UNIFORM_BUFFER
        | vk::BufferUsageFlags::TRANSFER_DST
        | vk::BufferUsageFlags::TRANSFER_SRC
        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS
}

fn host_flags() -> vk::MemoryPropertyFlags {
    vk::MemoryPropertyFlags::HOST_CACHED
        | vk::MemoryPropertyFlags::HOST_VISIBLE
        | vk::MemoryPropertyFlags::HOST_COHERENT
}

fn host_fallback_flags() -> vk::MemoryPropertyFlags {
    vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT
}

/// Byte sizes of the operand buffers for one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferSizes {
    pub a: u64,
    pub b: u64,
    pub c: u64,
    pub table: u64,
}

impl BufferSizes {
    /// A = G*sA*M*K, B = G*sB*K*N, C = G*sC*M*K*I.
    /// Fails with a configuration error when a size, or their sum, does not
    /// fit a u64.
    pub fn compute(
        groups: u32,
        tile: Tile,
        size_a: u64,
        size_b: u64,
        size_c: u64,
        insts_in_block: u32,
    ) -> Result<Self> {
        let g = groups as u64;
        let (m, n, k) = (tile.m as u64, tile.n as u64, tile.k as u64);
        let sizes = checked_product(&[g, size_a, m, k])
            .zip(checked_product(&[g, size_b, k, n]))
            .zip(checked_product(&[g, size_c, m, k, insts_in_block as u64]))
            .map(|((a, b), c)| BufferSizes {
                a,
                b,
                c,
                table: ADDRESS_TABLE_SIZE,
            })
            .filter(|s| s.a.checked_add(s.b).and_then(|ab| ab.checked_add(s.c)).is_some());
        sizes.ok_or_else(|| {
            BenchError::Configuration(format!(
                "operand buffers for {tile} with {groups} groups x {insts_in_block} insts \
                 overflow 64 bits"
            ))
        })
    }

    pub fn for_variant(
        variant: &EligibleVariant,
        groups: u32,
        insts_in_block: u32,
    ) -> Result<Self> {
        Self::compute(
            groups,
            variant.tile(),
            variant.a_type.size_bytes(),
            variant.b_type.size_bytes(),
            variant.c_type.size_bytes(),
            insts_in_block,
        )
    }

    pub fn operands(&self) -> [u64; 3] {
        [self.a, self.b, self.c]
    }

    pub fn operand_total(&self) -> u64 {
        self.a + self.b + self.c
    }
}

fn checked_product(factors: &[u64]) -> Option<u64> {
    factors.iter().try_fold(1u64, |acc, &f| acc.checked_mul(f))
}

/// First memory type allowed by `type_bits` whose flags include `flags`.
pub fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count.min(vk::MAX_MEMORY_TYPES as u32)).find(|&i| {
        type_bits & (1 << i) != 0
            && props.memory_types[i as usize].property_flags.contains(flags)
    })
}

pub fn align_up(offset: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return offset;
    }
    offset.div_ceil(alignment) * alignment
}

/// Where three sibling buffers live inside one allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionLayout {
    pub memory_type: u32,
    pub offsets: [u64; 3],
    pub size: u64,
}

/// Pick one memory type for three sibling buffers and pack them. Every
/// buffer must resolve to the same type; otherwise the region cannot be a
/// single allocation.
pub fn plan_region(
    region: &'static str,
    props: &vk::PhysicalDeviceMemoryProperties,
    reqs: &[vk::MemoryRequirements; 3],
    flags: vk::MemoryPropertyFlags,
) -> Result<RegionLayout> {
    let mut types = [0u32; 3];
    for (ty, req) in types.iter_mut().zip(reqs) {
        *ty = find_memory_type(props, req.memory_type_bits, flags).ok_or(
            BenchError::NoSuitableMemoryType {
                type_bits: req.memory_type_bits,
                flags,
            },
        )?;
    }
    let [a, b, c] = types;
    if a != b || a != c {
        return Err(BenchError::HeterogeneousMemory { region, a, b, c });
    }

    let mut offsets = [0u64; 3];
    let mut end = 0u64;
    for (offset, req) in offsets.iter_mut().zip(reqs) {
        *offset = align_up(end, req.alignment);
        end = *offset + req.size;
    }
    Ok(RegionLayout {
        memory_type: a,
        offsets,
        size: end,
    })
}

/// Host regions prefer cached memory and fall back to plain host-visible.
fn plan_host_region(
    region: &'static str,
    props: &vk::PhysicalDeviceMemoryProperties,
    reqs: &[vk::MemoryRequirements; 3],
) -> Result<RegionLayout> {
    match plan_region(region, props, reqs, host_flags()) {
        Err(BenchError::NoSuitableMemoryType { .. }) => {
            warn!("{region}: no host-cached memory type, using uncached host memory");
            plan_region(region, props, reqs, host_fallback_flags())
        }
        other => other,
    }
}

/// Buffers and memory of one benchmark run. Dropping it destroys every
/// buffer created so far, then frees every region allocated so far, so a
/// failure half-way through [`ResourceSet::allocate`] leaks nothing.
pub struct ResourceSet {
    device: ash::Device,
    pub sizes: BufferSizes,
    device_buffers: [vk::Buffer; 3],
    host_buffers: [vk::Buffer; 3],
    table_buffer: vk::Buffer,
    device_memory: vk::DeviceMemory,
    host_memory: vk::DeviceMemory,
    table_memory: vk::DeviceMemory,
    addresses: [vk::DeviceAddress; 3],
}

impl ResourceSet {
    pub fn allocate(
        gpu: &Gpu,
        variant: &EligibleVariant,
        groups: u32,
        insts_in_block: u32,
    ) -> Result<Self> {
        let sizes = BufferSizes::for_variant(variant, groups, insts_in_block)?;
        if sizes.operands().contains(&0) {
            return Err(BenchError::Configuration(format!(
                "zero-sized operand buffer for {} (groups={groups})",
                variant.descriptor
            )));
        }

        let mut set = ResourceSet {
            device: gpu.device().clone(),
            sizes,
            device_buffers: [vk::Buffer::null(); 3],
            host_buffers: [vk::Buffer::null(); 3],
            table_buffer: vk::Buffer::null(),
            device_memory: vk::DeviceMemory::null(),
            host_memory: vk::DeviceMemory::null(),
            table_memory: vk::DeviceMemory::null(),
            addresses: [0; 3],
        };
        let props = &gpu.caps.memory;

        for (i, size) in sizes.operands().into_iter().enumerate() {
            set.device_buffers[i] = set.create_buffer(size)?;
            set.host_buffers[i] = set.create_buffer(size)?;
        }
        set.table_buffer = set.create_buffer(sizes.table)?;

        let device_layout = plan_region(
            "device-local",
            props,
            &set.requirements(&set.device_buffers),
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )?;
        set.device_memory = set.allocate_region(&device_layout)?;
        set.bind(&set.device_buffers, set.device_memory, &device_layout)?;

        let host_layout =
            plan_host_region("host-visible", props, &set.requirements(&set.host_buffers))?;
        set.host_memory = set.allocate_region(&host_layout)?;
        set.bind(&set.host_buffers, set.host_memory, &host_layout)?;

        // SAFETY: table_buffer is a live buffer of this device.
        let table_req = unsafe { set.device.get_buffer_memory_requirements(set.table_buffer) };
        let table_layout = plan_host_region("address-table", props, &[table_req; 3])?;
        let table_layout = RegionLayout {
            offsets: [0; 3],
            size: table_req.size,
            ..table_layout
        };
        set.table_memory = set.allocate_region(&table_layout)?;
        // SAFETY: memory was allocated with a type the buffer accepts.
        unsafe {
            set.device
                .bind_buffer_memory(set.table_buffer, set.table_memory, 0)
        }
        .map_err(BenchError::resource("vkBindBufferMemory"))?;

        for (i, &buffer) in set.device_buffers.iter().enumerate() {
            let info = vk::BufferDeviceAddressInfo::default().buffer(buffer);
            // SAFETY: buffer is bound and was created with SHADER_DEVICE_ADDRESS.
            let address = unsafe { set.device.get_buffer_device_address(&info) };
            if address == 0 {
                return Err(BenchError::Configuration(format!(
                    "device address of operand buffer {i} is null"
                )));
            }
            set.addresses[i] = address;
        }
        set.write_address_table()?;

        debug!(
            "allocated {} device bytes (A={} B={} C={}) for {}",
            device_layout.size, sizes.a, sizes.b, sizes.c, variant.descriptor
        );
        Ok(set)
    }

    /// Buffer holding the three device addresses; bound as a uniform buffer.
    pub fn table_buffer(&self) -> vk::Buffer {
        self.table_buffer
    }

    fn create_buffer(&self, size: u64) -> Result<vk::Buffer> {
        let info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(buffer_usage())
            .sharing_mode(vk::SharingMode::EXCLUSIVE);
        // SAFETY: valid device and create info.
        unsafe { self.device.create_buffer(&info, None) }
            .map_err(BenchError::resource("vkCreateBuffer"))
    }

    fn requirements(&self, buffers: &[vk::Buffer; 3]) -> [vk::MemoryRequirements; 3] {
        // SAFETY: every buffer is live and belongs to this device.
        buffers.map(|b| unsafe { self.device.get_buffer_memory_requirements(b) })
    }

    fn allocate_region(&self, layout: &RegionLayout) -> Result<vk::DeviceMemory> {
        let mut flags_info =
            vk::MemoryAllocateFlagsInfo::default().flags(vk::MemoryAllocateFlags::DEVICE_ADDRESS);
        let info = vk::MemoryAllocateInfo::default()
            .allocation_size(layout.size)
            .memory_type_index(layout.memory_type)
            .push_next(&mut flags_info);
        // SAFETY: memory type index comes from this device's properties.
        unsafe { self.device.allocate_memory(&info, None) }
            .map_err(BenchError::resource("vkAllocateMemory"))
    }

    fn bind(
        &self,
        buffers: &[vk::Buffer; 3],
        memory: vk::DeviceMemory,
        layout: &RegionLayout,
    ) -> Result<()> {
        let infos: Vec<vk::BindBufferMemoryInfo<'_>> = buffers
            .iter()
            .zip(layout.offsets)
            .map(|(&buffer, offset)| {
                vk::BindBufferMemoryInfo::default()
                    .buffer(buffer)
                    .memory(memory)
                    .memory_offset(offset)
            })
            .collect();
        // SAFETY: offsets honour each buffer's alignment and fit the allocation.
        unsafe { self.device.bind_buffer_memory2(&infos) }
            .map_err(BenchError::resource("vkBindBufferMemory2"))
    }

    fn write_address_table(&self) -> Result<()> {
        // SAFETY: table memory is host-visible and not mapped elsewhere.
        let ptr = unsafe {
            self.device.map_memory(
                self.table_memory,
                0,
                vk::WHOLE_SIZE,
                vk::MemoryMapFlags::empty(),
            )
        }
        .map_err(BenchError::resource("vkMapMemory"))?;
        // SAFETY: the mapping spans at least ADDRESS_TABLE_SIZE bytes.
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.addresses.as_ptr().cast::<u8>(),
                ptr.cast::<u8>(),
                ADDRESS_TABLE_SIZE as usize,
            );
            self.device.unmap_memory(self.table_memory);
        }
        Ok(())
    }
}

impl Drop for ResourceSet {
    fn drop(&mut self) {
        let buffers = self
            .device_buffers
            .iter()
            .chain(&self.host_buffers)
            .chain(std::iter::once(&self.table_buffer));
        // SAFETY: the run that used these buffers has completed its wait-idle.
        unsafe {
            for &buffer in buffers.filter(|b| **b != vk::Buffer::null()) {
                self.device.destroy_buffer(buffer, None);
            }
            for memory in [self.device_memory, self.host_memory, self.table_memory] {
                if memory != vk::DeviceMemory::null() {
                    self.device.free_memory(memory, None);
                }
            }
        }
        debug!("released resource set ({} operand bytes)", self.sizes.operand_total());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props(types: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut p = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: types.len() as u32,
            ..Default::default()
        };
        for (slot, &flags) in p.memory_types.iter_mut().zip(types) {
            slot.property_flags = flags;
        }
        p
    }

    fn req(size: u64, alignment: u64, bits: u32) -> vk::MemoryRequirements {
        vk::MemoryRequirements {
            size,
            alignment,
            memory_type_bits: bits,
        }
    }

    #[test]
    fn sizes_follow_group_and_tile_dimensions() {
        let s = BufferSizes::compute(2, Tile::new(16, 8, 32), 2, 2, 4, 8).unwrap();
        assert_eq!(s.a, 2 * 2 * 16 * 32);
        assert_eq!(s.b, 2 * 2 * 32 * 8);
        assert_eq!(s.c, 2 * 4 * 16 * 32 * 8);
        assert_eq!(s.table, 24);
    }

    #[test]
    fn zero_groups_give_zero_sizes() {
        let s = BufferSizes::compute(0, Tile::new(16, 16, 16), 2, 2, 2, 8).unwrap();
        assert_eq!(s.operand_total(), 0);
    }

    #[test]
    fn oversized_buffers_are_a_configuration_error() {
        let huge = Tile::new(1 << 16, 1 << 16, 1 << 16);
        let err = BufferSizes::compute(u32::MAX, huge, 8, 8, 8, 1 << 12).unwrap_err();
        assert!(matches!(err, BenchError::Configuration(_)));
        // Each size fits, but their sum does not.
        let edge = Tile::new(1 << 31, 1, 1 << 30);
        assert!(BufferSizes::compute(1, edge, 4, 4, 4, 1).is_err());
    }

    #[test]
    fn alignment_rounds_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(512, 256), 512);
        assert_eq!(align_up(7, 0), 7);
    }

    #[test]
    fn memory_type_respects_filter_bits() {
        let p = props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        assert_eq!(find_memory_type(&p, 0b11, local), Some(0));
        assert_eq!(find_memory_type(&p, 0b10, local), Some(1));
        assert_eq!(find_memory_type(&p, 0b100, local), None);
    }

    #[test]
    fn region_offsets_are_aligned_and_packed() {
        let p = props(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);
        let reqs = [req(100, 64, 1), req(10, 256, 1), req(4, 16, 1)];
        let layout =
            plan_region("device-local", &p, &reqs, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap();
        assert_eq!(layout.offsets, [0, 256, 272]);
        assert_eq!(layout.size, 276);
        assert_eq!(layout.memory_type, 0);
    }

    #[test]
    fn split_memory_types_are_rejected() {
        let local = vk::MemoryPropertyFlags::DEVICE_LOCAL;
        let p = props(&[local, local]);
        let reqs = [req(64, 64, 0b01), req(64, 64, 0b10), req(64, 64, 0b01)];
        let err = plan_region("device-local", &p, &reqs, local).unwrap_err();
        assert!(matches!(
            err,
            BenchError::HeterogeneousMemory { a: 0, b: 1, c: 0, .. }
        ));
    }

    #[test]
    fn host_region_falls_back_to_uncached_memory() {
        let p = props(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        ]);
        let reqs = [req(64, 64, 0b11); 3];
        let layout = plan_host_region("host-visible", &p, &reqs).unwrap();
        assert_eq!(layout.memory_type, 1);
    }
}
