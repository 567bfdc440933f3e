use vergen_gitcl::{BuildBuilder, CargoBuilder, Emitter, GitclBuilder, RustcBuilder};

/// Git variables the binary embeds, with the value used when neither the
/// repository nor the build environment provides one.
const GIT_FALLBACKS: &[(&str, &str)] = &[
    ("VERGEN_GIT_SHA", "unknown"),
    ("VERGEN_GIT_BRANCH", "unknown"),
    ("VERGEN_GIT_COMMIT_TIMESTAMP", "unknown"),
    ("VERGEN_GIT_DIRTY", "false"),
];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut emitter = Emitter::default();
    emitter
        .add_instructions(&BuildBuilder::all_build()?)?
        .add_instructions(&CargoBuilder::all_cargo()?)?
        .add_instructions(&RustcBuilder::all_rustc()?)?;

    match GitclBuilder::all_git() {
        Ok(git) => {
            emitter.add_instructions(&git)?;
        }
        // Container builds have no .git; CI passes the values as build args.
        Err(_) => {
            for (name, default) in GIT_FALLBACKS {
                let value = std::env::var(name).unwrap_or_else(|_| (*default).to_string());
                println!("cargo::rustc-env={name}={value}");
            }
        }
    }

    emitter.emit()?;
    Ok(())
}
