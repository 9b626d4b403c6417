fn main() {
    std::process::exit(fscrawl::cli::run());
}
