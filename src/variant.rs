/// Cooperative matrix variants.
/// A variant is one (M x N x K tile, operand/accumulator types, scope)
/// configuration a device advertises through VK_KHR_cooperative_matrix.
/// Type and scope fields are kept as raw driver codes because drivers are
/// known to report values outside the defined enumerations.
use ash::vk;
use serde::{Deserialize, Serialize};

/// Element types of cooperative matrix operands.
/// Discriminants match VkComponentTypeKHR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentType {
    F16 = 0,
    F32 = 1,
    F64 = 2,
    S8 = 3,
    S16 = 4,
    S32 = 5,
    S64 = 6,
    U8 = 7,
    U16 = 8,
    U32 = 9,
    U64 = 10,
}

impl ComponentType {
    /// Highest raw code defined for VkComponentTypeKHR core values.
    pub const MAX_RAW: i32 = 10;

    pub const ALL: [ComponentType; 11] = [
        ComponentType::F16,
        ComponentType::F32,
        ComponentType::F64,
        ComponentType::S8,
        ComponentType::S16,
        ComponentType::S32,
        ComponentType::S64,
        ComponentType::U8,
        ComponentType::U16,
        ComponentType::U32,
        ComponentType::U64,
    ];

    pub fn from_raw(raw: i32) -> Option<Self> {
        if !(0..=Self::MAX_RAW).contains(&raw) {
            return None;
        }
        Some(Self::ALL[raw as usize])
    }

    pub fn raw(self) -> i32 {
        self as i32
    }

    /// Short name used in tables, e.g. "f16".
    pub fn name(self) -> &'static str {
        match self {
            ComponentType::F16 => "f16",
            ComponentType::F32 => "f32",
            ComponentType::F64 => "f64",
            ComponentType::S8 => "s8",
            ComponentType::S16 => "s16",
            ComponentType::S32 => "s32",
            ComponentType::S64 => "s64",
            ComponentType::U8 => "u8",
            ComponentType::U16 => "u16",
            ComponentType::U32 => "u32",
            ComponentType::U64 => "u64",
        }
    }

    /// GLSL type name (GL_EXT_shader_explicit_arithmetic_types).
    pub fn glsl_name(self) -> &'static str {
        match self {
            ComponentType::F16 => "float16_t",
            ComponentType::F32 => "float32_t",
            ComponentType::F64 => "float64_t",
            ComponentType::S8 => "int8_t",
            ComponentType::S16 => "int16_t",
            ComponentType::S32 => "int32_t",
            ComponentType::S64 => "int64_t",
            ComponentType::U8 => "uint8_t",
            ComponentType::U16 => "uint16_t",
            ComponentType::U32 => "uint32_t",
            ComponentType::U64 => "uint64_t",
        }
    }

    pub fn size_bytes(self) -> u64 {
        match self {
            ComponentType::S8 | ComponentType::U8 => 1,
            ComponentType::F16 | ComponentType::S16 | ComponentType::U16 => 2,
            ComponentType::F32 | ComponentType::S32 | ComponentType::U32 => 4,
            ComponentType::F64 | ComponentType::S64 | ComponentType::U64 => 8,
        }
    }

    pub fn is_float(self) -> bool {
        matches!(
            self,
            ComponentType::F16 | ComponentType::F32 | ComponentType::F64
        )
    }
}

impl std::fmt::Display for ComponentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Render a raw component code, including codes outside the enumeration.
pub fn component_name(raw: i32) -> &'static str {
    ComponentType::from_raw(raw)
        .map(ComponentType::name)
        .unwrap_or("bad_type")
}

/// Granularity of hardware threads sharing one matrix tile.
/// Discriminants match VkScopeKHR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Device = 1,
    Workgroup = 2,
    Subgroup = 3,
    QueueFamily = 5,
}

impl Scope {
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            1 => Some(Scope::Device),
            2 => Some(Scope::Workgroup),
            3 => Some(Scope::Subgroup),
            5 => Some(Scope::QueueFamily),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Scope::Device => "device",
            Scope::Workgroup => "wrkgrp",
            Scope::Subgroup => "subgrp",
            Scope::QueueFamily => "qfam",
        }
    }
}

pub fn scope_name(raw: i32) -> &'static str {
    Scope::from_raw(raw).map(Scope::name).unwrap_or("unknwn")
}

/// Matrix tile dimensions: A is M x K, B is K x N, C/D are M x N.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Tile {
    pub m: u32,
    pub n: u32,
    pub k: u32,
}

impl Tile {
    pub fn new(m: u32, n: u32, k: u32) -> Self {
        Tile { m, n, k }
    }

    /// Operations per multiply-accumulate of one tile (mul + add = 2).
    /// `None` if the count does not fit a u64.
    pub fn ops(&self) -> Option<u64> {
        (self.m as u64 * self.n as u64).checked_mul(self.k as u64)?.checked_mul(2)
    }
}

impl std::fmt::Display for Tile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:2} x {:2} x {:2}", self.m, self.n, self.k)
    }
}

/// One advertised cooperative matrix configuration, exactly as reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VariantDescriptor {
    pub tile: Tile,
    pub a_type: i32,
    pub b_type: i32,
    pub c_type: i32,
    pub result_type: i32,
    pub scope: i32,
    pub saturating: bool,
}

impl VariantDescriptor {
    /// Convenience constructor from typed fields.
    pub fn new(
        tile: Tile,
        a: ComponentType,
        b: ComponentType,
        c: ComponentType,
        result: ComponentType,
        scope: Scope,
    ) -> Self {
        VariantDescriptor {
            tile,
            a_type: a.raw(),
            b_type: b.raw(),
            c_type: c.raw(),
            result_type: result.raw(),
            scope: scope as i32,
            saturating: false,
        }
    }

    /// Table row in the form `M x N x K, A, B, C, D, scope, sat`.
    pub fn table_row(&self) -> String {
        format!(
            "{}, {:>3}, {:>3}, {:>3}, {:>3}, {:6}, {}",
            self.tile,
            component_name(self.a_type),
            component_name(self.b_type),
            component_name(self.c_type),
            component_name(self.result_type),
            scope_name(self.scope),
            self.saturating as u8,
        )
    }
}

impl From<&vk::CooperativeMatrixPropertiesKHR<'_>> for VariantDescriptor {
    fn from(p: &vk::CooperativeMatrixPropertiesKHR<'_>) -> Self {
        VariantDescriptor {
            tile: Tile::new(p.m_size, p.n_size, p.k_size),
            a_type: p.a_type.as_raw(),
            b_type: p.b_type.as_raw(),
            c_type: p.c_type.as_raw(),
            result_type: p.result_type.as_raw(),
            scope: p.scope.as_raw(),
            saturating: p.saturating_accumulation == vk::TRUE,
        }
    }
}

impl std::fmt::Display for VariantDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}, {:>3}, {:>3}, {:>3}, {:>3}",
            self.tile,
            component_name(self.a_type),
            component_name(self.b_type),
            component_name(self.c_type),
            component_name(self.result_type),
        )
    }
}

/// A variant that passed the capability filter: all types are known and
/// the subgroup width the kernel will run with is resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EligibleVariant {
    pub descriptor: VariantDescriptor,
    pub a_type: ComponentType,
    pub b_type: ComponentType,
    pub c_type: ComponentType,
    pub subgroup_size: u32,
}

impl EligibleVariant {
    pub fn tile(&self) -> Tile {
        self.descriptor.tile
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tile_ops_counts_mul_and_add() {
        assert_eq!(Tile::new(16, 8, 32).ops(), Some(16 * 8 * 32 * 2));
        assert_eq!(Tile::new(u32::MAX, u32::MAX, u32::MAX).ops(), None);
    }

    #[test]
    fn raw_codes_round_trip_for_every_type() {
        for ty in ComponentType::ALL {
            assert_eq!(ComponentType::from_raw(ty.raw()), Some(ty));
        }
    }

    #[test]
    fn out_of_range_codes_are_unknown() {
        assert_eq!(ComponentType::from_raw(11), None);
        assert_eq!(ComponentType::from_raw(-1), None);
        assert_eq!(ComponentType::from_raw(1_000_142_000), None);
        assert_eq!(component_name(1_000_142_000), "bad_type");
    }

    #[test]
    fn only_float_types_are_float() {
        let floats: Vec<_> = ComponentType::ALL
            .iter()
            .filter(|t| t.is_float())
            .map(|t| t.name())
            .collect();
        assert_eq!(floats, vec!["f16", "f32", "f64"]);
    }

    #[test]
    fn element_sizes() {
        assert_eq!(ComponentType::S8.size_bytes(), 1);
        assert_eq!(ComponentType::F16.size_bytes(), 2);
        assert_eq!(ComponentType::U32.size_bytes(), 4);
        assert_eq!(ComponentType::F64.size_bytes(), 8);
    }

    #[test]
    fn descriptor_from_vulkan_properties() {
        let props = vk::CooperativeMatrixPropertiesKHR::default()
            .m_size(16)
            .n_size(8)
            .k_size(32)
            .a_type(vk::ComponentTypeKHR::SINT8)
            .b_type(vk::ComponentTypeKHR::SINT8)
            .c_type(vk::ComponentTypeKHR::SINT32)
            .result_type(vk::ComponentTypeKHR::SINT32)
            .saturating_accumulation(false)
            .scope(vk::ScopeKHR::SUBGROUP);
        let desc = VariantDescriptor::from(&props);
        assert_eq!(desc.tile, Tile::new(16, 8, 32));
        assert_eq!(desc.a_type, ComponentType::S8.raw());
        assert_eq!(desc.c_type, ComponentType::S32.raw());
        assert_eq!(Scope::from_raw(desc.scope), Some(Scope::Subgroup));
        assert!(!desc.saturating);
    }

    #[test]
    fn table_row_lists_scope() {
        let desc = VariantDescriptor::new(
            Tile::new(16, 16, 16),
            ComponentType::F16,
            ComponentType::F16,
            ComponentType::F32,
            ComponentType::F32,
            Scope::Subgroup,
        );
        let row = desc.table_row();
        assert!(row.starts_with("16 x 16 x 16"));
        assert!(row.contains("subgrp"));
        assert!(row.contains("f32"));
    }
}
