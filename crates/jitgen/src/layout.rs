//! Value representation, frame layout and heap object layout.
//!
//! This module centralizes every constant shared between the code generator,
//! the simulator and the tests, so that emitted field offsets and the runtime's
//! view of memory always agree.

// ── Words ──

/// Size of a machine word in bytes.
pub const POINTER_SIZE: i32 = 4;

// ── Tagging ──

/// Tag value of a small integer.
pub const SMI_TAG: u32 = 0;
/// Number of low bits used by the smi tag.
pub const SMI_TAG_SIZE: u32 = 1;
/// Mask selecting the smi tag bits.
pub const SMI_TAG_MASK: u32 = (1 << SMI_TAG_SIZE) - 1;
/// Tag value of a heap object pointer.
pub const HEAP_OBJECT_TAG: u32 = 1;

/// Smallest value representable as a smi.
pub const SMI_MIN: i32 = -(1 << 30);
/// Largest value representable as a smi.
pub const SMI_MAX: i32 = (1 << 30) - 1;

/// Returns `true` if `value` fits in a smi.
#[must_use]
pub fn is_smi_value(value: i64) -> bool {
    value >= i64::from(SMI_MIN) && value <= i64::from(SMI_MAX)
}

/// Tagged bit pattern of the smi `value`. The caller guarantees the range.
#[must_use]
pub const fn smi(value: i32) -> i32 {
    value << SMI_TAG_SIZE
}

/// Untags a smi bit pattern.
#[must_use]
pub const fn untag_smi(raw: u32) -> i32 {
    (raw as i32) >> SMI_TAG_SIZE
}

/// Returns `true` if the word carries the smi tag.
#[must_use]
pub const fn has_smi_tag(raw: u32) -> bool {
    raw & SMI_TAG_MASK == SMI_TAG
}

/// Displacement for a field of a tagged heap object.
#[must_use]
pub const fn field(offset: i32) -> i32 {
    offset - HEAP_OBJECT_TAG as i32
}

// ── JS Frame Layout ──
//
// The caller pushes the receiver and the arguments. The callee's prologue
// pushes the return address, the caller's frame pointer, the context and the
// function, then points fp at the saved frame pointer.
//
//   fp + 8 + 4*n   receiver
//   fp + 8 + 4*i   parameter (n - 1 - i)
//   fp + 4         return address
//   fp + 0         caller fp
//   fp - 4         context
//   fp - 8         function
//   fp - 12 - 4*i  local i

/// Offset of the return address from fp.
pub const RETURN_ADDRESS_OFFSET: i32 = 4;
/// Offset of the caller's frame pointer from fp.
pub const CALLER_FP_OFFSET: i32 = 0;
/// Offset of the context slot from fp.
pub const CONTEXT_OFFSET: i32 = -4;
/// Offset of the function slot from fp.
pub const FUNCTION_OFFSET: i32 = -8;
/// Offset of the first local from fp.
pub const FIRST_LOCAL_OFFSET: i32 = -12;

/// Frame elements between the last parameter and the first local:
/// return address, caller fp, context, function.
pub const FRAME_HEADER_ELEMENTS: usize = 4;

/// Return address used for an outermost invocation.
pub const RETURN_SENTINEL: u32 = 0xFFFF_FFF0;

// ── Stack Handlers ──

/// Offset of the next-handler link inside a handler record.
pub const HANDLER_NEXT_OFFSET: i32 = 0;
/// Offset of the handler state.
pub const HANDLER_STATE_OFFSET: i32 = 4;
/// Offset of the saved frame pointer.
pub const HANDLER_FP_OFFSET: i32 = 8;
/// Offset of the handler's resume pc.
pub const HANDLER_PC_OFFSET: i32 = 12;
/// Size of a handler record in words.
pub const HANDLER_SIZE_IN_WORDS: usize = 4;

/// Handler state of a try/catch handler.
pub const HANDLER_TRY_CATCH: i32 = 0;
/// Handler state of a try/finally handler.
pub const HANDLER_TRY_FINALLY: i32 = 1;

// ── External References ──
//
// Cells at fixed addresses readable by emitted code.

/// Address of the cell holding the innermost handler (0 when none).
pub const HANDLER_ADDRESS: u32 = 0x1000;
/// Address of the cell holding the stack limit used by the stack guard.
pub const STACK_LIMIT_ADDRESS: u32 = 0x1004;

// ── Instance Types ──

/// String instance type. All strings sort below `FIRST_NONSTRING_TYPE`.
pub const STRING_TYPE: u32 = 0x01;
/// First instance type that is not a string.
pub const FIRST_NONSTRING_TYPE: u32 = 0x80;
pub const HEAP_NUMBER_TYPE: u32 = 0x81;
pub const ODDBALL_TYPE: u32 = 0x82;
pub const MAP_TYPE: u32 = 0x83;
pub const FIXED_ARRAY_TYPE: u32 = 0x84;
/// First instance type of a JS object.
pub const FIRST_JS_OBJECT_TYPE: u32 = 0x90;
pub const JS_OBJECT_TYPE: u32 = 0x90;
pub const JS_GLOBAL_OBJECT_TYPE: u32 = 0x91;
pub const JS_ARRAY_TYPE: u32 = 0x92;
pub const JS_REGEXP_TYPE: u32 = 0x93;
pub const JS_VALUE_TYPE: u32 = 0x94;
/// Last instance type of a non-callable JS object.
pub const LAST_JS_OBJECT_TYPE: u32 = 0x94;
/// Functions sort after every other JS object.
pub const JS_FUNCTION_TYPE: u32 = 0x95;

// ── Heap Object Layout ──

/// Every heap object starts with its map.
pub const MAP_OFFSET: i32 = 0;

pub const MAP_INSTANCE_TYPE_OFFSET: i32 = 4;
pub const MAP_BIT_FIELD_OFFSET: i32 = 8;
pub const MAP_PROTOTYPE_OFFSET: i32 = 12;
/// Fixed array of property names, in insertion order.
pub const MAP_DESCRIPTORS_OFFSET: i32 = 16;
/// Fixed array of enumerable names, or smi 0 when there is no cache.
pub const MAP_ENUM_CACHE_OFFSET: i32 = 20;
pub const MAP_SIZE: i32 = 24;

/// Map bit: the object compares loosely equal to `undefined`.
pub const MAP_IS_UNDETECTABLE: u32 = 1 << 5;
/// Map bit: the map is private to one object and not shared.
pub const MAP_IS_DICTIONARY: u32 = 1 << 6;

pub const HEAP_NUMBER_VALUE_OFFSET: i32 = 4;
pub const HEAP_NUMBER_SIZE: i32 = 12;

pub const STRING_LENGTH_OFFSET: i32 = 4;
/// Index of the string's contents in the string table.
pub const STRING_ID_OFFSET: i32 = 8;
pub const STRING_SIZE: i32 = 12;

pub const ODDBALL_KIND_OFFSET: i32 = 4;
pub const ODDBALL_SIZE: i32 = 8;

pub const FIXED_ARRAY_LENGTH_OFFSET: i32 = 4;
pub const FIXED_ARRAY_HEADER_SIZE: i32 = 8;

pub const JS_OBJECT_PROPERTIES_OFFSET: i32 = 4;
pub const JS_OBJECT_ELEMENTS_OFFSET: i32 = 8;
pub const JS_OBJECT_SIZE: i32 = 12;

pub const JS_ARRAY_LENGTH_OFFSET: i32 = 12;
pub const JS_ARRAY_SIZE: i32 = 16;

/// Wrapped primitive of a value object, or the source of a regexp.
pub const JS_VALUE_VALUE_OFFSET: i32 = 12;
/// Flags string of a regexp.
pub const JS_REGEXP_FLAGS_OFFSET: i32 = 16;
pub const JS_VALUE_SIZE: i32 = 20;

pub const JS_FUNCTION_SHARED_OFFSET: i32 = 12;
pub const JS_FUNCTION_CONTEXT_OFFSET: i32 = 16;
pub const JS_FUNCTION_LITERALS_OFFSET: i32 = 20;
pub const JS_FUNCTION_SIZE: i32 = 24;

// ── Contexts ──
//
// A context is a fixed array with the context map.

pub const CONTEXT_CLOSURE_INDEX: usize = 0;
pub const CONTEXT_FCONTEXT_INDEX: usize = 1;
pub const CONTEXT_PREVIOUS_INDEX: usize = 2;
pub const CONTEXT_EXTENSION_INDEX: usize = 3;
pub const CONTEXT_GLOBAL_INDEX: usize = 4;
/// Slots below this index are reserved.
pub const CONTEXT_MIN_SLOTS: usize = 5;

/// Displacement of element `index` of a tagged fixed array.
#[must_use]
pub const fn fixed_array_element(index: usize) -> i32 {
    field(FIXED_ARRAY_HEADER_SIZE + (index as i32) * POINTER_SIZE)
}

/// Displacement of context slot `index`.
#[must_use]
pub const fn context_slot(index: usize) -> i32 {
    fixed_array_element(index)
}

// ── Switch ──

/// Default bound on `span / case_count` for a jump-table switch.
pub const FAST_SWITCH_MAX_OVERHEAD_FACTOR: usize = 10;
/// Default minimum number of cases for a jump-table switch.
pub const FAST_SWITCH_MIN_CASE_COUNT: usize = 5;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smi_roundtrip_bounds() {
        assert_eq!(untag_smi(smi(SMI_MAX) as u32), SMI_MAX);
        assert_eq!(untag_smi(smi(SMI_MIN) as u32), SMI_MIN);
        assert_eq!(untag_smi(smi(-1) as u32), -1);
        assert!(has_smi_tag(smi(12345) as u32));
    }

    #[test]
    fn test_smi_range() {
        assert!(is_smi_value(1 << 29));
        assert!(!is_smi_value(1 << 30));
        assert!(is_smi_value(-(1 << 30)));
        assert!(!is_smi_value(-(1 << 30) - 1));
    }

    #[test]
    fn test_field_offsets_untag() {
        assert_eq!(field(MAP_OFFSET), -1);
        assert_eq!(fixed_array_element(0), 7);
        assert_eq!(context_slot(CONTEXT_GLOBAL_INDEX), 23);
    }
}
