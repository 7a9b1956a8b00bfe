use loadplane::error::AppResult;

fn main() -> AppResult<()> {
    loadplane::entry::run()
}
