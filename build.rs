use std::env;
use std::path::PathBuf;

fn main() {
    println!("cargo:rerun-if-env-changed=LIBTORCH");
    println!("cargo:rerun-if-env-changed=LIBTORCH_USE_PYTORCH");

    // torch-sys finds the libraries through the PyTorch install
    if env::var_os("LIBTORCH_USE_PYTORCH").is_some() {
        return;
    }

    let libtorch = env::var_os("LIBTORCH")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("libtorch"));
    let lib_dir = libtorch.join("lib");
    if !lib_dir.is_dir() {
        println!(
            "cargo:warning=libtorch not found at {}; set LIBTORCH",
            lib_dir.display()
        );
        return;
    }

    println!("cargo:rustc-link-search=native={}", lib_dir.display());
    for lib in ["torch", "c10"] {
        println!("cargo:rustc-link-lib=dylib={}", lib);
    }
}
