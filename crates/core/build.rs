fn main() {
    println!("cargo:rerun-if-env-changed=SG_COM_LIB_DIR");

    if std::env::var_os("CARGO_FEATURE_NATIVE").is_none() {
        return;
    }
    // libSG_Com is linked by the extern block; only its location is needed here.
    if let Some(dir) = std::env::var_os("SG_COM_LIB_DIR") {
        println!("cargo:rustc-link-search=native={}", dir.to_string_lossy());
    }
}
