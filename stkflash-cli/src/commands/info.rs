//! Image info command implementation.

use {
    crate::{commands::flash::open_store, config::Config},
    anyhow::{Context, Result},
    console::style,
    std::path::Path,
    stkflash::{ImageStats, target::DEFAULT_PAGE_SIZE},
};

/// Info command implementation.
pub(crate) fn cmd_info(
    config: &Config,
    image: &Path,
    json: bool,
    page_size: Option<u8>,
) -> Result<()> {
    let (store, name) = open_store(image)?;
    let stats = ImageStats::from_store(&store, &name)
        .with_context(|| format!("Failed to read image {}", image.display()))?;
    let page_size = page_size
        .or(config.flash.page_size)
        .unwrap_or(DEFAULT_PAGE_SIZE);
    let pages = stats.pages(usize::from(page_size));

    if json {
        let info = serde_json::json!({
            "ok": true,
            "data": {
                "image": image.display().to_string(),
                "stats": stats,
                "page_size": page_size,
                "pages": pages,
                "foreign_payload": stats.has_foreign_payload(),
            }
        });
        println!("{}", serde_json::to_string_pretty(&info)?);
        return Ok(());
    }

    eprintln!("{} {}", style("Image:").bold(), image.display());
    eprintln!("  Records:       {}", stats.records);
    eprintln!("  Data records:  {}", stats.data_records);
    eprintln!("  Data bytes:    {}", stats.data_bytes);
    eprintln!("  Pages:         {pages} x {page_size} bytes");
    if !stats.has_end_record {
        eprintln!("  {} no end-of-file record", style("⚠").yellow());
    }
    if stats.has_foreign_payload() {
        eprintln!(
            "  {} {} bytes of non-data records are streamed as data",
            style("⚠").yellow(),
            stats.payload_bytes - stats.data_bytes
        );
    }

    Ok(())
}
