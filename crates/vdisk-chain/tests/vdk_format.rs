use uuid::Uuid;
use vdisk_chain::{
    ChsGeometry, FileAccess, FileLocator, ImageFile, MemFileLocator, VdkCreateParams, VdkImage,
};
use vdisk_core::{StreamExtent, VdError};

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

#[test]
fn created_image_reopens_with_identical_header() {
    let locator = MemFileLocator::new();
    let image = create_base(&locator, "base.vdk", 0x11);
    let header = image.header().clone();
    drop(image);

    let reopened = VdkImage::open(
        locator.open("base.vdk", FileAccess::Read).unwrap(),
        "base.vdk",
    )
    .unwrap();
    assert_eq!(reopened.header(), &header);
    assert_eq!(reopened.unique_id(), fixed_id(0x11));
    assert!(!reopened.needs_parent());
    assert_eq!(reopened.capacity_bytes(), CAPACITY);
}

#[test]
fn unallocated_blocks_read_zero_and_writes_persist() {
    let locator = MemFileLocator::new();
    let mut image = create_base(&locator, "base.vdk", 0x11);

    let mut buf = vec![0xAAu8; 4096];
    image.read_content(0, &mut buf).unwrap();
    assert!(buf.iter().all(|&b| b == 0));
    assert!(image.content_extents().unwrap().is_empty());

    // A write that straddles two blocks allocates both and zero-seeds the
    // untouched remainder.
    let payload = vec![0x5Au8; 4096];
    image.write_content(BLOCK_SIZE as u64 - 100, &payload).unwrap();
    assert!(image.is_block_allocated(0));
    assert!(image.is_block_allocated(1));
    assert_eq!(
        image.content_extents().unwrap(),
        vec![StreamExtent::new(0, 2 * BLOCK_SIZE as u64)]
    );
    image.flush().unwrap();
    drop(image);

    let mut reopened = VdkImage::open(
        locator.open("base.vdk", FileAccess::Read).unwrap(),
        "base.vdk",
    )
    .unwrap();
    let mut back = vec![0u8; 4096 + 200];
    reopened
        .read_content(BLOCK_SIZE as u64 - 200, &mut back)
        .unwrap();
    assert!(back[..100].iter().all(|&b| b == 0), "zero-seeded prefix");
    assert!(back[100..4196].iter().all(|&b| b == 0x5A));
    assert!(back[4196..].iter().all(|&b| b == 0), "zero-seeded suffix");
}

#[test]
fn differencing_images_record_their_parent_hints() {
    let locator = MemFileLocator::new();
    let mut params = VdkCreateParams::differencing(
        CAPACITY,
        BLOCK_SIZE,
        fixed_id(0x22),
        vec!["../base.vdk".to_string(), "base.vdk".to_string()],
    );
    params.unique_id = Some(fixed_id(0x33));
    let image = VdkImage::create(locator.create("child.vdk"), params).unwrap();
    assert!(image.needs_parent());
    assert_eq!(image.parent_unique_id(), fixed_id(0x22));
    drop(image);

    let reopened = VdkImage::open(
        locator.open("child.vdk", FileAccess::Read).unwrap(),
        "child.vdk",
    )
    .unwrap();
    assert_eq!(
        reopened.parent_location_hints(),
        vec!["../base.vdk".to_string(), "base.vdk".to_string()]
    );
    assert_eq!(reopened.parent_unique_id(), fixed_id(0x22));
}

#[test]
fn geometry_survives_a_round_trip() {
    let locator = MemFileLocator::new();
    let mut params = VdkCreateParams::base(CAPACITY, BLOCK_SIZE);
    params.unique_id = Some(fixed_id(0x11));
    params.geometry = Some(ChsGeometry::from_capacity(CAPACITY));
    drop(VdkImage::create(locator.create("geo.vdk"), params).unwrap());

    let reopened = VdkImage::open(
        locator.open("geo.vdk", FileAccess::Read).unwrap(),
        "geo.vdk",
    )
    .unwrap();
    let geometry = reopened.header().geometry.unwrap();
    assert_eq!(geometry, ChsGeometry::from_capacity(CAPACITY));
    assert!(geometry.total_sectors() <= CAPACITY / 512);
    assert!(geometry.heads >= 4);
}

#[test]
fn ata_translation_matches_known_points() {
    // 512 sectors: 17 sectors per track, minimum 4 heads.
    let small = ChsGeometry::from_capacity(512 * 512);
    assert_eq!(small.sectors_per_track, 17);
    assert_eq!(small.heads, 4);
    assert_eq!(small.cylinders, 7);

    // Huge capacities clamp at the 65535 x 16 x 255 ceiling.
    let huge = ChsGeometry::from_capacity(3 * 1024 * 1024 * 1024 * 1024);
    assert_eq!(huge.sectors_per_track, 255);
    assert_eq!(huge.heads, 16);
    assert_eq!(huge.cylinders, 65535);
}

#[test]
fn read_only_opens_reject_writes() {
    let locator = MemFileLocator::new();
    drop(create_base(&locator, "base.vdk", 0x11));

    let mut image = VdkImage::open(
        locator.open("base.vdk", FileAccess::Read).unwrap(),
        "base.vdk",
    )
    .unwrap();
    assert!(!image.can_write());
    assert!(matches!(
        image.write_content(0, &[1]).unwrap_err(),
        VdError::NotWritable
    ));
}

#[test]
fn closed_images_stop_serving_content() {
    let locator = MemFileLocator::new();
    let mut image = create_base(&locator, "base.vdk", 0x11);
    image.write_content(0, &[1; 16]).unwrap();

    image.close();
    assert!(image.is_closed());
    image.close(); // idempotent

    let mut buf = [0u8; 16];
    assert!(matches!(
        image.read_content(0, &mut buf).unwrap_err(),
        VdError::Io(_)
    ));
    assert_eq!(locator.open_handles("base.vdk"), 0);
}

#[test]
fn create_validates_geometry() {
    let locator = MemFileLocator::new();
    assert!(matches!(
        VdkImage::create(locator.create("x"), VdkCreateParams::base(CAPACITY, 1000)).unwrap_err(),
        VdError::NotSupported(_)
    ));
    assert!(matches!(
        VdkImage::create(locator.create("x"), VdkCreateParams::base(0, BLOCK_SIZE)).unwrap_err(),
        VdError::NotSupported(_)
    ));
    assert!(matches!(
        VdkImage::create(locator.create("x"), VdkCreateParams::base(CAPACITY + 7, BLOCK_SIZE))
            .unwrap_err(),
        VdError::NotSupported(_)
    ));
}

fn corrupt_byte(locator: &MemFileLocator, path: &str, offset: u64, value: u8) {
    let mut stream = locator.open(path, FileAccess::ReadWrite).unwrap();
    stream.write_all_at(offset, &[value]).unwrap();
}

#[test]
fn open_rejects_corrupt_headers() {
    let locator = MemFileLocator::new();
    drop(create_base(&locator, "base.vdk", 0x11));

    corrupt_byte(&locator, "base.vdk", 0, b'X');
    assert!(matches!(
        VdkImage::open(locator.open("base.vdk", FileAccess::Read).unwrap(), "p").unwrap_err(),
        VdError::Corrupt("bad image magic")
    ));
}

#[test]
fn open_rejects_unsupported_versions() {
    let locator = MemFileLocator::new();
    drop(create_base(&locator, "base.vdk", 0x11));

    corrupt_byte(&locator, "base.vdk", 8, 9);
    assert!(matches!(
        VdkImage::open(locator.open("base.vdk", FileAccess::Read).unwrap(), "p").unwrap_err(),
        VdError::NotSupported("image version")
    ));
}

#[test]
fn open_rejects_truncated_files() {
    let locator = MemFileLocator::new();
    locator.insert("tiny.vdk", vec![0u8; 64]);
    assert!(matches!(
        VdkImage::open(locator.open("tiny.vdk", FileAccess::Read).unwrap(), "p").unwrap_err(),
        VdError::Corrupt("image header truncated")
    ));
}

#[test]
fn open_rejects_misaligned_and_duplicate_allocations() {
    let locator = MemFileLocator::new();
    {
        let mut image = create_base(&locator, "base.vdk", 0x11);
        image.write_content(0, &[1; 16]).unwrap();
        image
            .write_content(BLOCK_SIZE as u64, &[2; 16])
            .unwrap();
    }

    let data_offset = {
        let image = VdkImage::open(
            locator.open("base.vdk", FileAccess::Read).unwrap(),
            "base.vdk",
        )
        .unwrap();
        image.header().data_offset
    };

    // Point the second table entry at the first block: duplicate.
    let mut stream = locator.open("base.vdk", FileAccess::ReadWrite).unwrap();
    stream
        .write_all_at(512 + 8, &data_offset.to_le_bytes())
        .unwrap();
    drop(stream);
    assert!(matches!(
        VdkImage::open(locator.open("base.vdk", FileAccess::Read).unwrap(), "p").unwrap_err(),
        VdError::Corrupt("duplicate data block offset")
    ));

    // Misalign the first entry.
    let mut stream = locator.open("base.vdk", FileAccess::ReadWrite).unwrap();
    stream
        .write_all_at(512, &(data_offset + 1).to_le_bytes())
        .unwrap();
    stream
        .write_all_at(512 + 8, &(data_offset + BLOCK_SIZE as u64).to_le_bytes())
        .unwrap();
    drop(stream);
    assert!(matches!(
        VdkImage::open(locator.open("base.vdk", FileAccess::Read).unwrap(), "p").unwrap_err(),
        VdError::Corrupt("misaligned data block offset")
    ));
}
