fn main() {
    std::process::exit(scentry::entry::cli::run_healthcheck());
}
