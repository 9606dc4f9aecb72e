//! Direct/indirect argument classification.
//!
//! Small plain-old-data values cross the bridge by value, split into integer lanes; everything
//! else is passed as an opaque pointer to caller-owned storage. The classification only depends on
//! the type's layout and flags, so it's computed once per type and shared by callers and callees.

use core::fmt;
use core::ptr;

use witness::{ConstOpaquePtr, OpaquePtr, MetadataHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LaneType {
    U8,
    U16,
    U32,
    U64,
}

impl LaneType {
    pub fn size(self) -> usize {
        match self {
            LaneType::U8 => 1,
            LaneType::U16 => 2,
            LaneType::U32 => 4,
            LaneType::U64 => 8,
        }
    }

    fn for_size(size: usize) -> Self {
        match size {
            1 => LaneType::U8,
            2 => LaneType::U16,
            4 => LaneType::U32,
            8 => LaneType::U64,
            _ => unreachable!("no lane of size {}", size),
        }
    }

    /// The C name of the lane's integer type.
    pub fn c_name(self) -> &'static str {
        match self {
            LaneType::U8 => "uint8_t",
            LaneType::U16 => "uint16_t",
            LaneType::U32 => "uint32_t",
            LaneType::U64 => "uint64_t",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Lane {
    pub ty: LaneType,
    pub offset: usize,
}

impl Lane {
    pub fn end(&self) -> usize {
        self.offset + self.ty.size()
    }
}

/// How a directly passed value is split into lanes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DirectLayout {
    lanes: Vec<Lane>,
}

impl DirectLayout {
    /// Covers `size` bytes with the widest naturally aligned lanes that fit.
    pub fn for_size(size: usize) -> Self {
        let mut lanes = vec![];
        let mut offset = 0;
        while offset < size {
            let remaining = size - offset;
            let width = [8, 4, 2, 1].iter()
                                    .copied()
                                    .find(|w| *w <= remaining && offset % w == 0)
                                    .unwrap_or(1);
            lanes.push(Lane { ty: LaneType::for_size(width), offset });
            offset += width;
        }
        Self { lanes }
    }

    pub fn lanes(&self) -> &[Lane] {
        &self.lanes
    }
}

/// Renders as e.g. `uint32_t_0_4`, which is also how pass/return thunks are named.
impl fmt::Display for DirectLayout {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (i, lane) in self.lanes.iter().enumerate() {
            if i > 0 {
                f.write_str("_")?;
            }
            write!(f, "{}_{}_{}", lane.ty.c_name(), lane.offset, lane.end())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AbiClass {
    Direct(DirectLayout),
    Indirect,
}

impl AbiClass {
    /// Classifies a type.
    ///
    /// Direct passing requires a POD, bitwise-takable type that fits in `max_lanes` lanes.
    pub fn classify(metadata: MetadataHandle, max_lanes: usize) -> Self {
        let vwt = metadata.witnesses();
        if !vwt.is_pod() || !vwt.is_bitwise_takable() {
            return AbiClass::Indirect;
        }

        let layout = DirectLayout::for_size(vwt.size);
        if layout.lanes.len() > max_lanes {
            AbiClass::Indirect
        } else {
            AbiClass::Direct(layout)
        }
    }
}

/// A value passed in lanes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectValue {
    layout: DirectLayout,
    words: Vec<u64>,
}

impl DirectValue {
    /// Loads a value out of memory.
    ///
    /// # Safety
    ///
    /// `src` must be valid for reads of every lane.
    pub unsafe fn load(layout: &DirectLayout, src: ConstOpaquePtr) -> Self {
        let words = layout.lanes.iter().map(|lane| {
            let p = src.add(lane.offset);
            match lane.ty {
                LaneType::U8 => *p as u64,
                LaneType::U16 => ptr::read_unaligned(p as *const u16) as u64,
                LaneType::U32 => ptr::read_unaligned(p as *const u32) as u64,
                LaneType::U64 => ptr::read_unaligned(p as *const u64),
            }
        }).collect();

        Self { layout: layout.clone(), words }
    }

    /// Stores the value into memory.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of every lane.
    pub unsafe fn store(&self, dst: OpaquePtr) {
        for (lane, word) in self.layout.lanes.iter().zip(&self.words) {
            let p = dst.add(lane.offset);
            match lane.ty {
                LaneType::U8 => *p = *word as u8,
                LaneType::U16 => ptr::write_unaligned(p as *mut u16, *word as u16),
                LaneType::U32 => ptr::write_unaligned(p as *mut u32, *word as u32),
                LaneType::U64 => ptr::write_unaligned(p as *mut u64, *word),
            }
        }
    }

    pub fn layout(&self) -> &DirectLayout {
        &self.layout
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use witness::resolve;

    use crate::genopt::GenericOpt;

    #[test]
    fn lanes() {
        assert_eq!(DirectLayout::for_size(0).to_string(), "");
        assert_eq!(DirectLayout::for_size(2).to_string(), "uint16_t_0_2");
        assert_eq!(DirectLayout::for_size(3).to_string(), "uint16_t_0_2_uint8_t_2_3");
        assert_eq!(DirectLayout::for_size(4).to_string(), "uint32_t_0_4");
        assert_eq!(DirectLayout::for_size(12).to_string(), "uint64_t_0_8_uint32_t_8_12");
        assert_eq!(DirectLayout::for_size(7).lanes().len(), 3);
    }

    #[test]
    fn classify() {
        assert_eq!(AbiClass::classify(resolve::<u16>(), 4),
                   AbiClass::Direct(DirectLayout::for_size(2)));
        assert_eq!(AbiClass::classify(resolve::<String>(), 4), AbiClass::Indirect);
        assert_eq!(AbiClass::classify(resolve::<u64>(), 0), AbiClass::Indirect);
        assert_eq!(AbiClass::classify(resolve::<()>(), 0),
                   AbiClass::Direct(DirectLayout::for_size(0)));
    }

    #[test]
    fn classify_enum() {
        match AbiClass::classify(GenericOpt::<u16>::metadata(), 4) {
            AbiClass::Direct(layout) => assert_eq!(layout.to_string(), "uint32_t_0_4"),
            AbiClass::Indirect => panic!("GenericOpt<u16> should be passed directly"),
        }

        assert_eq!(AbiClass::classify(GenericOpt::<String>::metadata(), 4), AbiClass::Indirect);
    }

    #[test]
    fn load_store() {
        let layout = DirectLayout::for_size(12);
        let src: [u8; 12] = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

        let value = unsafe { DirectValue::load(&layout, src.as_ptr()) };
        assert_eq!(value.words().len(), 2);
        assert_eq!(value.words()[1], u32::from_ne_bytes([9, 10, 11, 12]) as u64);

        let mut dst = [0u8; 12];
        unsafe { value.store(dst.as_mut_ptr()) };
        assert_eq!(src, dst);
    }
}
