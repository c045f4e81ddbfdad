//! End-to-end: labels table -> train/test split -> cropped dataset.

use std::fs;
use std::path::Path;

use image::{Rgb, RgbImage};
use tempfile::TempDir;

use vehicle_prep::region::{COCO_CAR, COCO_TRUCK};
use vehicle_prep::{
    split_dataset_from_path, BackgroundRemover, Detection, LinkMode, PixelBox, SplitOptions,
    SplitOutcome, StubBackend, VehicleRegionSelector,
};

const PERSON: u32 = 0;

const LABELS: &str = "img_name,class,subset
000001.png,Audi S4 Sedan 2012,train
000002.png,Audi S4 Sedan 2012,test
000003.png,Ram CV Cargo Van Minivan 2012,train
";

fn write_raw_images(dir: &Path) {
    fs::create_dir_all(dir).unwrap();
    for (name, shade) in [("000001.png", 40u8), ("000002.png", 90), ("000003.png", 160)] {
        RgbImage::from_pixel(640, 480, Rgb([shade, shade, shade]))
            .save(dir.join(name))
            .unwrap();
    }
}

fn image_size(path: &Path) -> (u32, u32) {
    let img = image::open(path).unwrap();
    (img.width(), img.height())
}

#[test]
fn split_then_remove_background() {
    let tmp = TempDir::new().unwrap();
    let raw = tmp.path().join("car_ims");
    let labels = tmp.path().join("car_dataset_labels.csv");
    let v1 = tmp.path().join("car_ims_v1");
    let v2 = tmp.path().join("car_ims_v2");

    write_raw_images(&raw);
    fs::write(&labels, LABELS).unwrap();

    let outcome =
        split_dataset_from_path(&raw, &labels, &v1, &SplitOptions::default()).unwrap();
    assert_eq!(outcome, SplitOutcome::Completed { files: 3 });
    assert!(v1.join("train/Audi S4 Sedan 2012/000001.png").is_file());
    assert!(v1.join("test/Audi S4 Sedan 2012/000002.png").is_file());
    assert!(v1.join("train/Ram CV Cargo Van Minivan 2012/000003.png").is_file());

    // A person covering the whole frame must not beat the car.
    let detector = StubBackend::with_detections(vec![
        Detection::new(PERSON, PixelBox::new(0.0, 0.0, 640.0, 480.0), 0.99),
        Detection::new(COCO_CAR, PixelBox::new(100.0, 50.0, 300.0, 250.0), 0.8),
        Detection::new(COCO_TRUCK, PixelBox::new(400.0, 400.0, 450.0, 450.0), 0.7),
    ]);
    let mut remover = BackgroundRemover::new(detector, VehicleRegionSelector::default());
    let mut regions = Vec::new();
    let stats = remover
        .run(&v1, &v2, |img, _| regions.push(img.region.as_tuple()))
        .unwrap();

    assert_eq!(stats.processed, 3);
    assert_eq!(stats.full_frame, 0);
    assert!(regions.iter().all(|r| *r == (100, 50, 300, 250)));
    for rel in [
        "train/Audi S4 Sedan 2012/000001.png",
        "test/Audi S4 Sedan 2012/000002.png",
        "train/Ram CV Cargo Van Minivan 2012/000003.png",
    ] {
        assert_eq!(image_size(&v2.join(rel)), (200, 200), "{rel}");
    }
}

#[test]
fn images_without_vehicles_keep_full_frame() {
    let tmp = TempDir::new().unwrap();
    let raw = tmp.path().join("car_ims");
    let labels = tmp.path().join("labels.csv");
    let v1 = tmp.path().join("v1");
    let v2 = tmp.path().join("v2");

    write_raw_images(&raw);
    fs::write(&labels, LABELS).unwrap();
    split_dataset_from_path(
        &raw,
        &labels,
        &v1,
        &SplitOptions {
            link_mode: LinkMode::Copy,
        },
    )
    .unwrap();

    let mut remover = BackgroundRemover::new(StubBackend::new(), VehicleRegionSelector::default());
    let stats = remover.run(&v1, &v2, |_, _| {}).unwrap();

    assert_eq!(stats.processed, 3);
    assert_eq!(stats.full_frame, 3);
    assert_eq!(
        image_size(&v2.join("test/Audi S4 Sedan 2012/000002.png")),
        (640, 480)
    );
}

#[test]
fn second_split_is_a_no_op() {
    let tmp = TempDir::new().unwrap();
    let raw = tmp.path().join("car_ims");
    let labels = tmp.path().join("labels.csv");
    let v1 = tmp.path().join("v1");

    write_raw_images(&raw);
    fs::write(&labels, LABELS).unwrap();

    let options = SplitOptions::default();
    split_dataset_from_path(&raw, &labels, &v1, &options).unwrap();
    let before = fs::read(v1.join("train/Audi S4 Sedan 2012/000001.png")).unwrap();

    // Labels table disappears: the existing split is still honoured.
    fs::remove_file(&labels).unwrap();
    let outcome = split_dataset_from_path(&raw, &labels, &v1, &options).unwrap();
    assert_eq!(outcome, SplitOutcome::Skipped);
    assert_eq!(
        fs::read(v1.join("train/Audi S4 Sedan 2012/000001.png")).unwrap(),
        before
    );
}
