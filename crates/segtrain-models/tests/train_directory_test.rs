//! Trains the reference network on a generated PNG training set.

use image::GrayImage;
use segtrain_models::{DirectoryDatasetLoader, PixelConvNetBuilder};
use segtrain_training::{CheckpointSlot, CheckpointStore, RunOptions, TrainingConfig, TrainingRequest, train_model};
use std::fs;
use std::path::Path;
use tempfile::TempDir;

/// Bright squares on a dark background; the mask marks the squares.
fn write_split(root: &Path, split: &str, count: usize) {
    let dir = root.join(split);
    fs::create_dir_all(&dir).unwrap();
    for index in 0..count {
        let offset = (index % 3) as u32;
        let inside = |x: u32, y: u32| (offset..offset + 3).contains(&x) && (1..4).contains(&y);
        let image = GrayImage::from_fn(6, 6, |x, y| image::Luma([if inside(x, y) { 220 } else { 30 }]));
        let mask = GrayImage::from_fn(6, 6, |x, y| image::Luma([if inside(x, y) { 255 } else { 0 }]));
        image.save(dir.join(format!("image_{index}.png"))).unwrap();
        mask.save(dir.join(format!("mask_{index}.png"))).unwrap();
    }
}

fn config(weighted_cost: bool) -> TrainingConfig {
    TrainingConfig {
        learning_rate: 0.01,
        depth: 1,
        convolution_per_layer: vec![1],
        size_of_convolutions_per_layer: vec![vec![3]],
        features_per_convolution: vec![vec![8]],
        batch_size: 2,
        weighted_cost,
        ..TrainingConfig::default()
    }
}

fn run(weighted_cost: bool) {
    let temp = TempDir::new().unwrap();
    let data = temp.path().join("data");
    write_split(&data, "train", 4);
    write_split(&data, "validation", 2);

    let options = RunOptions { max_epoch: 4, save_step: 5, ..RunOptions::default() };
    let request = TrainingRequest::new(&data, temp.path().join("run"), config(weighted_cost)).with_options(options);

    let outcome = train_model(request, &DirectoryDatasetLoader::new(Some(1)), &PixelConvNetBuilder::new(Some(1))).unwrap();
    assert_eq!(outcome.steps, 12);
    assert_eq!(outcome.last_epoch, 3);

    let latest = CheckpointStore::restore(&temp.path().join("run").join(CheckpointSlot::Latest.file_name())).unwrap();
    assert!(latest.parameters.get("conv/weights").is_some());
    assert!(latest.parameters.get("batch_norm/moving_mean").is_some());
}

#[test]
fn test_trains_on_png_directory() {
    run(false);
}

#[test]
fn test_trains_with_class_balanced_weights() {
    run(true);
}

#[test]
fn test_seeded_collaborators_reproduce_the_run() {
    let temp = TempDir::new().unwrap();
    let data = temp.path().join("data");
    write_split(&data, "train", 4);
    write_split(&data, "validation", 2);

    let train_into = |name: &str| {
        let options = RunOptions { max_epoch: 3, save_step: 100, ..RunOptions::default() };
        let request = TrainingRequest::new(&data, temp.path().join(name), config(false)).with_options(options);
        train_model(request, &DirectoryDatasetLoader::new(Some(7)), &PixelConvNetBuilder::new(Some(7))).unwrap();
        CheckpointStore::restore(&temp.path().join(name).join(CheckpointSlot::Latest.file_name())).unwrap()
    };

    assert_eq!(train_into("a").parameters, train_into("b").parameters);
}
