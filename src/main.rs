fn main() -> anyhow::Result<()> {
    rd_cli::run()
}
