use super::*;

#[test]
fn test_alloc_free_cycle() {
    let mut region = MemRegion::new(4096, 1024);
    assert_eq!(region.capacity_blocks(), 4);

    let a = region.alloc(100).unwrap();
    let b = region.alloc(1024).unwrap();
    assert_ne!(a.offset, b.offset);
    assert_eq!(region.free_blocks(), 2);

    region.free(a);
    assert_eq!(region.free_blocks(), 3);
}

#[test]
fn test_alloc_exhaustion() {
    let mut region = MemRegion::new(2048, 1024);
    let _a = region.alloc(10).unwrap();
    let _b = region.alloc(10).unwrap();
    assert_eq!(region.alloc(10), None);
}

#[test]
fn test_oversized_alloc_refused() {
    let mut region = MemRegion::new(4096, 1024);
    assert_eq!(region.alloc(1025), None);
    assert_eq!(region.free_blocks(), 4);
}

#[test]
fn test_write_and_slice() {
    let mut region = MemRegion::new(2048, 1024);
    let block = region.alloc(5).unwrap();
    region.write(&block, b"hello");
    assert_eq!(region.slice(&block), b"hello");
}
