use std::cell::RefCell;
use std::rc::Rc;

use uuid::Uuid;
use vdisk_chain::{
    DiskChain, FileAccess, FileLocator, ImageFile, MemFileLocator, VdkCreateParams, VdkImage,
    VdkOpener,
};
use vdisk_core::{Ownership, SparseStream, VdError};

const CAPACITY: u64 = 256 * 1024;
const BLOCK_SIZE: u32 = 16 * 1024;

fn fixed_id(n: u128) -> Uuid {
    Uuid::from_u128(n)
}

fn create_base(locator: &MemFileLocator, path: &str, id: u128) -> VdkImage {
    let mut params = VdkCreateParams::base(CAPACITY, BLOCK_SIZE);
    params.unique_id = Some(fixed_id(id));
    VdkImage::create(locator.create(path), params).unwrap()
}

fn create_diff(
    locator: &MemFileLocator,
    path: &str,
    id: u128,
    parent_id: u128,
    hints: &[&str],
) -> VdkImage {
    let mut params = VdkCreateParams::differencing(
        CAPACITY,
        BLOCK_SIZE,
        fixed_id(parent_id),
        hints.iter().map(|h| h.to_string()).collect(),
    );
    params.unique_id = Some(fixed_id(id));
    VdkImage::create(locator.create(path), params).unwrap()
}

/// A, B, C where A is the child, B its parent, C the self-contained base.
fn three_level_fixture() -> MemFileLocator {
    let locator = MemFileLocator::new();
    drop(create_base(&locator, "c.vdk", 0xC));
    drop(create_diff(&locator, "b.vdk", 0xB, 0xC, &["c.vdk"]));
    drop(create_diff(&locator, "a.vdk", 0xA, 0xB, &["b.vdk"]));
    locator
}

#[test]
fn resolve_walks_hints_to_the_base_image() {
    let locator = three_level_fixture();
    let chain = DiskChain::resolve(&locator, "a.vdk", FileAccess::Read, &VdkOpener).unwrap();

    assert_eq!(chain.layer_count(), 3);
    let ids: Vec<Uuid> = chain
        .layers()
        .iter()
        .map(|layer| layer.image().borrow().unique_id())
        .collect();
    assert_eq!(ids, vec![fixed_id(0xA), fixed_id(0xB), fixed_id(0xC)]);
    assert!(!chain.layers()[2].image().borrow().needs_parent());
    assert_eq!(chain.capacity_bytes(), CAPACITY);

    let content = chain.content().unwrap();
    assert_eq!(content.len(), CAPACITY);

    drop(content);
    drop(chain);
    for path in ["a.vdk", "b.vdk", "c.vdk"] {
        assert_eq!(locator.open_handles(path), 0, "{path} still open");
    }
}

#[test]
fn chain_reads_fall_through_to_the_deepest_layer_with_data() {
    let locator = MemFileLocator::new();
    {
        let mut base = create_base(&locator, "base.vdk", 0xC);
        base.write_content(0, &vec![0xBB; BLOCK_SIZE as usize]).unwrap();
        base.write_content(BLOCK_SIZE as u64, &vec![0xB0; 512]).unwrap();
    }
    {
        let mut child = create_diff(&locator, "child.vdk", 0xA, 0xC, &["base.vdk"]);
        child.write_content(0, &vec![0xAA; 512]).unwrap();
    }

    let chain = DiskChain::resolve(&locator, "child.vdk", FileAccess::Read, &VdkOpener).unwrap();
    let mut content = chain.content().unwrap();

    let mut buf = vec![0u8; 2 * BLOCK_SIZE as usize];
    content.set_position(0).unwrap();
    assert_eq!(content.read(&mut buf).unwrap(), buf.len());

    // Child materialized its whole first block on write, so the rest of
    // that block reads as the child's zero-seed, not the base bytes.
    assert!(buf[..512].iter().all(|&b| b == 0xAA));
    assert!(buf[512..BLOCK_SIZE as usize].iter().all(|&b| b == 0));
    // The second block falls through to the base.
    let second = &buf[BLOCK_SIZE as usize..];
    assert!(second[..512].iter().all(|&b| b == 0xB0));
    assert!(second[512..].iter().all(|&b| b == 0));
}

#[test]
fn chain_writes_promote_into_the_top_image() {
    let locator = MemFileLocator::new();
    {
        let mut base = create_base(&locator, "base.vdk", 0xC);
        base.write_content(0, &vec![0xBB; BLOCK_SIZE as usize]).unwrap();
    }
    drop(create_diff(&locator, "child.vdk", 0xA, 0xC, &["base.vdk"]));

    {
        let chain =
            DiskChain::resolve(&locator, "child.vdk", FileAccess::ReadWrite, &VdkOpener).unwrap();
        let mut content = chain.content().unwrap();
        content.write_all_at(100, &[0x11; 16]).unwrap();
        content.flush().unwrap();
    }

    // The child now stores the whole promoted block: base bytes around the
    // write, payload inside it.
    let mut child = VdkImage::open(
        locator.open("child.vdk", FileAccess::Read).unwrap(),
        "child.vdk",
    )
    .unwrap();
    assert!(child.is_block_allocated(0));
    let mut block = vec![0u8; BLOCK_SIZE as usize];
    child.read_content(0, &mut block).unwrap();
    assert!(block[..100].iter().all(|&b| b == 0xBB));
    assert!(block[100..116].iter().all(|&b| b == 0x11));
    assert!(block[116..].iter().all(|&b| b == 0xBB));

    // The base is untouched.
    let mut base = VdkImage::open(
        locator.open("base.vdk", FileAccess::Read).unwrap(),
        "base.vdk",
    )
    .unwrap();
    let mut block = vec![0u8; BLOCK_SIZE as usize];
    base.read_content(0, &mut block).unwrap();
    assert!(block.iter().all(|&b| b == 0xBB));
}

#[test]
fn mismatched_parent_identity_fails_and_leaves_no_handles() {
    let locator = MemFileLocator::new();
    // The file the hint points at has identity 0xEE, not the expected 0xC.
    drop(create_base(&locator, "base.vdk", 0xEE));
    drop(create_diff(&locator, "child.vdk", 0xA, 0xC, &["base.vdk"]));

    match DiskChain::resolve(&locator, "child.vdk", FileAccess::Read, &VdkOpener).unwrap_err() {
        VdError::ChainMismatch {
            expected,
            found,
            path,
        } => {
            assert_eq!(expected, fixed_id(0xC));
            assert_eq!(found, fixed_id(0xEE));
            assert_eq!(path, "mem:base.vdk");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(locator.open_handles("child.vdk"), 0);
    assert_eq!(locator.open_handles("base.vdk"), 0);
}

#[test]
fn exhausted_hints_fail_with_the_tried_list() {
    let locator = MemFileLocator::new();
    drop(create_diff(
        &locator,
        "child.vdk",
        0xA,
        0xC,
        &["missing1.vdk", "missing2.vdk"],
    ));

    match DiskChain::resolve(&locator, "child.vdk", FileAccess::Read, &VdkOpener).unwrap_err() {
        VdError::ParentNotFound { path, tried } => {
            assert_eq!(path, "mem:child.vdk");
            assert_eq!(tried, vec!["missing1.vdk", "missing2.vdk"]);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(locator.open_handles("child.vdk"), 0);
}

#[test]
fn relative_hints_resolve_through_the_locator() {
    let locator = MemFileLocator::new();
    drop(create_base(&locator, "../base.vdk", 0xC));
    drop(create_diff(&locator, "top.vdk", 0xA, 0xC, &["../base.vdk"]));

    let chain = DiskChain::resolve(&locator, "top.vdk", FileAccess::Read, &VdkOpener).unwrap();
    assert_eq!(chain.layer_count(), 2);
    assert!(!chain.layers()[1].image().borrow().needs_parent());
    assert_eq!(chain.content().unwrap().len(), CAPACITY);
}

#[test]
fn second_hint_is_tried_when_the_first_is_absent() {
    let locator = MemFileLocator::new();
    drop(create_base(&locator, "base.vdk", 0xC));
    drop(create_diff(
        &locator,
        "child.vdk",
        0xA,
        0xC,
        &["../base.vdk", "base.vdk"],
    ));

    let chain = DiskChain::resolve(&locator, "child.vdk", FileAccess::Read, &VdkOpener).unwrap();
    assert_eq!(chain.layer_count(), 2);
    assert_eq!(chain.content().unwrap().len(), CAPACITY);
}

fn shared(image: VdkImage) -> Rc<RefCell<dyn ImageFile>> {
    Rc::new(RefCell::new(image))
}

#[test]
fn explicit_chains_verify_adjacent_identities() {
    let locator = MemFileLocator::new();
    let base = shared(create_base(&locator, "base.vdk", 0xC));
    let child = shared(create_diff(&locator, "child.vdk", 0xA, 0xC, &["base.vdk"]));

    let chain = DiskChain::from_images(vec![
        (child.clone(), Ownership::Dispose),
        (base.clone(), Ownership::None),
    ])
    .unwrap();
    assert_eq!(chain.layer_count(), 2);
    drop(chain);

    // Wrong order: the adjacency check fails.
    let base2 = shared(create_base(&locator, "b2.vdk", 0xC2));
    let child2 = shared(create_diff(&locator, "c2.vdk", 0xA2, 0xC, &["b2.vdk"]));
    assert!(matches!(
        DiskChain::from_images(vec![
            (base2.clone(), Ownership::None),
            (child2.clone(), Ownership::None)
        ])
        .unwrap_err(),
        VdError::ChainMismatch { .. }
    ));

    // A trailing image that still needs a parent is not a valid chain end.
    assert!(matches!(
        DiskChain::from_images(vec![(child2, Ownership::None)]).unwrap_err(),
        VdError::ParentNotFound { .. }
    ));
}

#[test]
fn teardown_honors_per_layer_ownership() {
    let locator = MemFileLocator::new();
    let base = shared(create_base(&locator, "base.vdk", 0xC));
    let child = shared(create_diff(&locator, "child.vdk", 0xA, 0xC, &["base.vdk"]));

    let chain = DiskChain::from_images(vec![
        (child.clone(), Ownership::Dispose),
        (base.clone(), Ownership::None),
    ])
    .unwrap();
    drop(chain);

    assert!(child.borrow().is_closed(), "owned top layer must be closed");
    assert!(!base.borrow().is_closed(), "shared parent must stay open");
    assert_eq!(locator.open_handles("child.vdk"), 0);
    assert_eq!(locator.open_handles("base.vdk"), 1);
}

#[test]
fn closed_chain_content_streams_stop_working() {
    let locator = three_level_fixture();
    let mut chain = DiskChain::resolve(&locator, "a.vdk", FileAccess::Read, &VdkOpener).unwrap();
    let mut content = chain.content().unwrap();

    chain.close();
    let mut buf = [0u8; 16];
    assert!(matches!(content.read(&mut buf).unwrap_err(), VdError::Io(_)));
}
