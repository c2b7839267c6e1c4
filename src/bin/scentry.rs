fn main() -> anyhow::Result<()> {
    scentry::entry::main()
}
