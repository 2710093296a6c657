// build.rs

use std::{env, fs, path::Path};

const DEFAULT_MAP_SIZE: usize = 1 << 15;

fn main() {
    let out_dir = env::var_os("OUT_DIR").unwrap();
    let out_dir = Path::new(&out_dir);

    println!("cargo:rerun-if-env-changed=ROFL_MAP_SIZE");
    let map_size = match env::var("ROFL_MAP_SIZE") {
        Ok(val) => val
            .trim()
            .parse::<usize>()
            .unwrap_or_else(|err| panic!("ROFL_MAP_SIZE={val} is not a number: {err}")),
        Err(_) => DEFAULT_MAP_SIZE,
    };
    assert!(
        map_size.is_power_of_two() && map_size >= 8,
        "ROFL_MAP_SIZE={map_size} must be a power of two and at least 8"
    );

    fs::write(
        out_dir.join("constants.rs"),
        format!(
            "/// The size of the coverage map, in bytes. Set at build time with `ROFL_MAP_SIZE`.\n\
             pub const MAP_SIZE: usize = {map_size};\n"
        ),
    )
    .expect("Could not write constants.rs");

    println!("cargo:rerun-if-changed=build.rs");
}
