#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use quill_store::config::DatabaseOptions;

pub fn options(path: &Path) -> DatabaseOptions {
    let mut options = DatabaseOptions::new(path);
    options.buffer = options.buffer.with_page_size(1024usize).with_frames(64usize);
    options.btree = options
        .btree
        .with_leaf_capacity(Some(8u16))
        .with_internal_capacity(Some(8u16));
    options.checkpoint_interval = None;
    options.lock.deadlock_interval = Some(Duration::from_millis(20));
    options
}

pub fn key(i: u32) -> Vec<u8> {
    format!("key{:05}", i).into_bytes()
}

pub fn value(i: u32) -> Vec<u8> {
    format!("value{}", i).into_bytes()
}
