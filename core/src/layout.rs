//! Merged data layout for the loaded bitcode libraries.
//!
//! Each library may contribute a layout fragment; fragments are merged into
//! one agreement that answers the size/alignment/offset queries. The merge is
//! a commutative, associative union; a later fragment that contradicts an
//! already-agreed entry is a fatal configuration fault, since offsets handed
//! out for already-loaded types must never change.

use rustc_hash::FxHashMap;

/// Type descriptor consumed by the layout queries. Widths are in bits.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Type {
    Integer(u32),
    Float(u32),
    Pointer,
    Array { elem: Box<Type>, len: u64 },
    Struct { fields: Vec<Type>, packed: bool },
}

/// Size/alignment agreement for one primitive type class, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayoutEntry {
    pub size: u64,
    pub alignment: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum LayoutKey {
    Integer(u32),
    Float(u32),
    Pointer,
}

#[derive(Debug, Clone, Default)]
pub struct DataLayout {
    entries: FxHashMap<LayoutKey, LayoutEntry>,
}

impl DataLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an explicit agreement for an integer width.
    pub fn set_integer(&mut self, bits: u32, entry: LayoutEntry) {
        self.insert(LayoutKey::Integer(bits), entry);
    }

    pub fn set_float(&mut self, bits: u32, entry: LayoutEntry) {
        self.insert(LayoutKey::Float(bits), entry);
    }

    pub fn set_pointer(&mut self, entry: LayoutEntry) {
        self.insert(LayoutKey::Pointer, entry);
    }

    fn insert(&mut self, key: LayoutKey, entry: LayoutEntry) {
        if let Some(existing) = self.entries.get(&key) {
            assert!(
                *existing == entry,
                "conflicting data layout for {key:?}: agreed {existing:?}, got {entry:?}"
            );
            return;
        }
        self.entries.insert(key, entry);
    }

    /// Merge another fragment into this layout. Commutative and associative;
    /// a conflicting entry for an already-agreed key is fatal.
    pub fn merge(&mut self, other: &DataLayout) {
        for (key, entry) in &other.entries {
            self.insert(*key, *entry);
        }
    }

    fn entry(&self, key: LayoutKey) -> LayoutEntry {
        if let Some(entry) = self.entries.get(&key) {
            return *entry;
        }
        // Natural layout when no library pinned one down.
        match key {
            LayoutKey::Integer(bits) => {
                let size = (u64::from(bits).max(1)).div_ceil(8);
                LayoutEntry {
                    size,
                    alignment: size.next_power_of_two().min(8),
                }
            }
            LayoutKey::Float(bits) => {
                let size = u64::from(bits) / 8;
                LayoutEntry {
                    size,
                    alignment: size.min(8),
                }
            }
            LayoutKey::Pointer => LayoutEntry { size: 8, alignment: 8 },
        }
    }

    pub fn alignment_of(&self, ty: &Type) -> u64 {
        match ty {
            Type::Integer(bits) => self.entry(LayoutKey::Integer(*bits)).alignment,
            Type::Float(bits) => self.entry(LayoutKey::Float(*bits)).alignment,
            Type::Pointer => self.entry(LayoutKey::Pointer).alignment,
            Type::Array { elem, .. } => self.alignment_of(elem),
            Type::Struct { fields, packed } => {
                if *packed {
                    1
                } else {
                    fields.iter().map(|f| self.alignment_of(f)).max().unwrap_or(1)
                }
            }
        }
    }

    pub fn size_of(&self, ty: &Type) -> u64 {
        match ty {
            Type::Integer(bits) => self.entry(LayoutKey::Integer(*bits)).size,
            Type::Float(bits) => self.entry(LayoutKey::Float(*bits)).size,
            Type::Pointer => self.entry(LayoutKey::Pointer).size,
            Type::Array { elem, len } => self.stride_of(elem) * len,
            Type::Struct { fields, packed } => {
                let mut offset = 0;
                for field in fields {
                    if !packed {
                        offset += self.padding_at(offset, field);
                    }
                    offset += self.size_of(field);
                }
                if !packed && !fields.is_empty() {
                    let align = self.alignment_of(ty);
                    offset += (align - offset % align) % align;
                }
                offset
            }
        }
    }

    /// Padding needed before a value of `ty` placed at `offset`.
    pub fn padding_at(&self, offset: u64, ty: &Type) -> u64 {
        let align = self.alignment_of(ty);
        (align - offset % align) % align
    }

    /// Byte offset of member `index` inside an aggregate type.
    pub fn offset_of(&self, index: usize, ty: &Type) -> u64 {
        match ty {
            Type::Array { elem, len } => {
                assert!((index as u64) < *len, "array index {index} out of bounds");
                self.stride_of(elem) * index as u64
            }
            Type::Struct { fields, packed } => {
                assert!(index < fields.len(), "struct member {index} out of bounds");
                let mut offset = 0;
                for (i, field) in fields.iter().enumerate().take(index + 1) {
                    if !packed {
                        offset += self.padding_at(offset, field);
                    }
                    if i == index {
                        break;
                    }
                    offset += self.size_of(field);
                }
                offset
            }
            _ => panic!("offset_of on non-aggregate type {ty:?}"),
        }
    }

    fn stride_of(&self, elem: &Type) -> u64 {
        let size = self.size_of(elem);
        let align = self.alignment_of(elem);
        size + (align - size % align) % align
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn i32_entry() -> LayoutEntry {
        LayoutEntry { size: 4, alignment: 4 }
    }

    #[test]
    fn merge_is_commutative() {
        let mut a = DataLayout::new();
        a.set_integer(32, i32_entry());
        let mut b = DataLayout::new();
        b.set_pointer(LayoutEntry { size: 8, alignment: 8 });

        let mut ab = a.clone();
        ab.merge(&b);
        let mut ba = b.clone();
        ba.merge(&a);

        let ty = Type::Struct {
            fields: vec![Type::Integer(32), Type::Pointer],
            packed: false,
        };
        assert_eq!(ab.size_of(&ty), ba.size_of(&ty));
        assert_eq!(ab.offset_of(1, &ty), 8);
    }

    #[test]
    #[should_panic(expected = "conflicting data layout")]
    fn merge_conflict_is_fatal() {
        let mut a = DataLayout::new();
        a.set_integer(32, i32_entry());
        let mut b = DataLayout::new();
        b.set_integer(32, LayoutEntry { size: 4, alignment: 8 });
        a.merge(&b);
    }

    #[test]
    fn re_agreeing_the_same_entry_is_fine() {
        let mut a = DataLayout::new();
        a.set_integer(32, i32_entry());
        let mut b = DataLayout::new();
        b.set_integer(32, i32_entry());
        a.merge(&b);
        assert_eq!(a.size_of(&Type::Integer(32)), 4);
    }

    #[test]
    fn struct_offsets_respect_padding() {
        let layout = DataLayout::new();
        let ty = Type::Struct {
            fields: vec![Type::Integer(8), Type::Integer(64)],
            packed: false,
        };
        assert_eq!(layout.offset_of(0, &ty), 0);
        assert_eq!(layout.offset_of(1, &ty), 8);
        assert_eq!(layout.size_of(&ty), 16);

        let packed = Type::Struct {
            fields: vec![Type::Integer(8), Type::Integer(64)],
            packed: true,
        };
        assert_eq!(layout.offset_of(1, &packed), 1);
        assert_eq!(layout.size_of(&packed), 9);
    }

    #[test]
    fn array_elements_are_stride_spaced() {
        let layout = DataLayout::new();
        let ty = Type::Array {
            elem: Box::new(Type::Integer(32)),
            len: 4,
        };
        assert_eq!(layout.size_of(&ty), 16);
        assert_eq!(layout.offset_of(2, &ty), 8);
        assert_eq!(layout.padding_at(2, &Type::Integer(32)), 2);
    }
}
