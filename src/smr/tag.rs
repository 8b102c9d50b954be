/// Returns the two-bit tag field of the pointer.
pub(crate) fn tag<P>(ptr: *mut P) -> usize {
    ptr as usize & 3
}

/// Returns the pointer with the tag field replaced.
pub(crate) fn with_tag<P>(ptr: *mut P, tag: usize) -> *mut P {
    debug_assert!(tag <= 3);
    ((ptr as usize & !3) | tag) as *mut P
}

/// Returns the pointer with the tag field erased.
pub(crate) fn untag<P>(ptr: *mut P) -> *mut P {
    (ptr as usize & !3) as *mut P
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tag_round_trip() {
        let ptr: *mut u64 = &mut 17_u64;
        assert_eq!(tag(ptr), 0);
        for t in 0..4 {
            let tagged = with_tag(ptr, t);
            assert_eq!(tag(tagged), t);
            assert_eq!(untag(tagged), ptr);
        }
    }
}
