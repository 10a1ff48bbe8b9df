use std::os::{fd::AsFd, unix::fs::FileExt};

use hostkit_mmap_alloc::{AlignedMapping, MappingRequest, host_page_size};
use region::Protection;

fn protection_at(addr: *const u8) -> Protection {
    region::query(addr).unwrap().protection()
}

fn fill_and_check(mapping: &mut AlignedMapping, seed: u8) {
    for (i, byte) in mapping.as_mut_slice().iter_mut().enumerate() {
        *byte = seed.wrapping_add(i as u8);
    }
    for (i, byte) in mapping.as_slice().iter().enumerate() {
        assert_eq!(*byte, seed.wrapping_add(i as u8));
    }
}

#[test]
fn ten_pages_aligned_to_four() {
    let page = host_page_size();
    let mut mapping = MappingRequest::new(10 * page, 4 * page)
        .shared(false)
        .persistent(false)
        .map()
        .unwrap();

    assert_eq!(mapping.as_ptr() as usize % (4 * page), 0);
    assert_eq!(mapping.len(), 10 * page);
    fill_and_check(&mut mapping, 7);
}

#[test]
fn alignment_is_honoured_for_every_power_of_two() {
    let page = host_page_size();
    for shift in 0..6 {
        let align = page << shift;
        for pages in [1, 3, 16] {
            let mut mapping = MappingRequest::new(pages * page, align).map().unwrap();
            assert_eq!(mapping.as_ptr() as usize % align, 0, "align {align:#x}");
            assert_eq!(mapping.len(), pages * page);
            fill_and_check(&mut mapping, shift as u8);
        }
    }
}

#[test]
fn guard_extents_are_inaccessible() {
    let page = host_page_size();
    let mapping = MappingRequest::new(2 * page, 64 * page).map().unwrap();
    let base = mapping.as_ptr();

    assert_eq!(protection_at(base), Protection::READ_WRITE);
    assert_eq!(
        protection_at(base.wrapping_add(mapping.len() - 1)),
        Protection::READ_WRITE
    );

    assert!(mapping.has_trailing_guard());
    assert_eq!(protection_at(base.wrapping_add(mapping.len())), Protection::NONE);

    if mapping.slack_len() > 0 {
        assert_eq!(protection_at(base.wrapping_sub(1)), Protection::NONE);
        assert_eq!(
            protection_at(base.wrapping_sub(mapping.slack_len())),
            Protection::NONE
        );
    }
}

#[test]
fn shared_file_mapping_writes_through() {
    let page = host_page_size();
    let (size, align) = (4 * page, 2 * page);
    let file = tempfile::tempfile().unwrap();
    file.set_len((size + align + page) as u64).unwrap();

    let mut mapping = MappingRequest::new(size, align)
        .backed_by(file.as_fd())
        .shared(true)
        .map()
        .unwrap();
    assert_eq!(mapping.page_size(), page);
    assert_eq!(mapping.as_ptr() as usize % align, 0);

    mapping.as_mut_slice()[..5].copy_from_slice(b"guest");
    mapping.as_mut_slice()[size - 3..].copy_from_slice(b"end");

    // The usable window starts `slack` bytes into the file.
    let mut head = [0u8; 5];
    file.read_exact_at(&mut head, mapping.slack_len() as u64).unwrap();
    assert_eq!(&head, b"guest");

    let mut tail = [0u8; 3];
    file.read_exact_at(&mut tail, (mapping.slack_len() + size - 3) as u64).unwrap();
    assert_eq!(&tail, b"end");
}

#[test]
fn private_file_mapping_does_not_write_through() {
    let page = host_page_size();
    let file = tempfile::tempfile().unwrap();
    file.set_len((4 * page) as u64).unwrap();

    let mut mapping = MappingRequest::new(2 * page, page)
        .backed_by(file.as_fd())
        .map()
        .unwrap();
    mapping.as_mut_slice().fill(0xff);

    let mut head = [0u8; 16];
    file.read_exact_at(&mut head, mapping.slack_len() as u64).unwrap();
    assert_eq!(head, [0u8; 16]);
}

#[test]
fn mappings_can_be_sent_between_threads() {
    let page = host_page_size();
    let mut mapping = MappingRequest::new(page, page).map().unwrap();
    mapping.as_mut_slice()[0] = 42;
    let value = std::thread::spawn(move || mapping.as_slice()[0]).join().unwrap();
    assert_eq!(value, 42);
}
