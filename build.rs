fn main() {
    if let Err(e) = built::write_built_file() {
        println!("cargo:warning=failed to write build-time information: {e}");
    }
}
