/*
 * SPDX-FileCopyrightText: 2025 Sven Shi
 * SPDX-License-Identifier: GPL-3.0-or-later
 */

use std::fs;
use std::path::Path;

fn main() {
    let src = "./resource/config.yaml";
    println!("cargo:rerun-if-changed={src}");

    // `target/<profile>/build/<pkg>-<hash>/out` -> `target/<profile>/`
    let out_dir = std::env::var("OUT_DIR").unwrap();
    let profile_dir = Path::new(&out_dir)
        .ancestors()
        .nth(3)
        .unwrap_or_else(|| Path::new(&out_dir));

    fs::copy(src, profile_dir.join("config.yaml")).expect("Failed to copy config.yaml");
}
