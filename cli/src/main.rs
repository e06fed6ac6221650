// Good defaults
#![forbid(unused_must_use)]
#![deny(unsafe_code)]

#[tokio::main(flavor = "current_thread")]
async fn main() {
    syscon_utils::initialize_tracing();
    tracing::trace!("starting");
    let r = syscon_lib::cli::run_from_iter(std::env::args()).await;
    if let Err(e) = r {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
