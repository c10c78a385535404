use vergen::EmitBuilder;

fn main() {
    // Emit the cargo build metadata used in `--version` output.  Failing to get it shouldn't fail
    // the build; `emit` falls back to defaults for anything it can't determine.
    if let Err(e) = EmitBuilder::builder().all_cargo().emit() {
        println!("cargo:warning=Failed to emit build metadata: {e}");
        println!("cargo:rustc-env=VERGEN_CARGO_TARGET_TRIPLE=unknown");
    }
}
