//! Microbenchmarks for tag construction and key hashing.

use forque::{Tag, TagKey};

fn main() {
    divan::main();
}

#[divan::bench]
fn key_from_i64() -> TagKey {
    TagKey::new(divan::black_box(0x5eed_f00d_i64))
}

#[divan::bench]
fn tag_from_tuple_depth3() -> Tag {
    Tag::from(divan::black_box((7_i32, 40_u64, "leaf")))
}

#[divan::bench(args = [1, 3, 6])]
fn tag_builder(depth: usize) -> Tag {
    let mut builder = Tag::builder();
    for level in 0..depth {
        builder = builder.level(divan::black_box(level as i64));
    }
    builder.build().unwrap()
}

#[divan::bench]
fn view_walk_depth6() -> usize {
    let tag = Tag::from((1_i64, 2_i64, 3_i64, 4_i64, 5_i64, 6_i64));
    let mut view = divan::black_box(&tag).view();
    let mut levels: usize = 1;
    while !view.last() {
        view = view.next();
        levels += 1;
    }
    levels
}
