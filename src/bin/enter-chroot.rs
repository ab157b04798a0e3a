use anyhow::Result;

fn main() -> Result<()> {
    guestroot::cli::run()
}
