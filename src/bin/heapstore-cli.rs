use std::error::Error;
use std::path::{Path, PathBuf};

use clap::{Parser, Subcommand};

use heapstore::{
    encode_heap_page, FieldType, HeapStore, Schema, StorageConfig, Tuple, Value,
};

#[derive(Parser)]
#[command(name = "heapstore-cli", version, about = "Inspect and seed heap files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write a demo heap file of (id int, name text) tuples
    Seed {
        /// Path of the heap file to create
        path: PathBuf,
        /// Number of pages to write
        #[arg(long, default_value_t = 3)]
        pages: usize,
        /// Number of tuples per page
        #[arg(long, default_value_t = 10)]
        rows: usize,
    },
    /// Print a heap file's identity, schema and per-page occupancy
    Info {
        path: PathBuf,
    },
    /// Scan every live tuple through the buffer pool and print it
    Scan {
        path: PathBuf,
    },
}

fn demo_schema() -> Schema {
    Schema::with_names(&[FieldType::Int, FieldType::Text], &["id", "name"])
        .expect("demo schema is non-empty")
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    match cli.command {
        Command::Seed { path, pages, rows } => seed(&path, pages, rows),
        Command::Info { path } => info(&path),
        Command::Scan { path } => scan(&path),
    }
}

fn seed(path: &Path, pages: usize, rows: usize) -> Result<(), Box<dyn Error>> {
    let config = StorageConfig::default();
    let schema = demo_schema();

    let mut bytes = Vec::with_capacity(pages * config.page_size);
    let mut next_id = 0;
    for _ in 0..pages {
        let tuples: Vec<Tuple> = (0..rows)
            .map(|_| {
                let tuple = Tuple::new(vec![
                    Value::Int(next_id),
                    Value::text(&format!("user{}", next_id)),
                ]);
                next_id += 1;
                tuple
            })
            .collect();
        bytes.extend(encode_heap_page(&schema, &tuples, config.page_size)?);
    }
    std::fs::write(path, bytes)?;
    println!(
        "wrote {} pages ({} tuples) to {}",
        pages,
        pages * rows,
        path.display()
    );
    Ok(())
}

fn open_store_and_table(
    path: &Path,
) -> Result<(HeapStore, std::sync::Arc<heapstore::HeapFile>), Box<dyn Error>> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let file_name = path
        .file_name()
        .ok_or("path has no file name")?
        .to_string_lossy()
        .into_owned();

    let store = HeapStore::new(dir, StorageConfig::default())?;
    let file = store.open_table(&file_name, demo_schema())?;
    Ok((store, file))
}

fn info(path: &Path) -> Result<(), Box<dyn Error>> {
    let (_store, file) = open_store_and_table(path)?;

    println!("heap file: {}", path.display());
    println!("  identity: {:#018x}", file.id());
    println!("  schema: {}", file.schema());
    println!("  tuple size: {} bytes", file.schema().byte_size());
    println!("  pages: {}", file.page_count());
    for page_no in 0..file.page_count() {
        let page = file.read_page(file.page_id(page_no))?;
        println!(
            "  page {}: {} live / {} slots",
            page_no,
            page.live_count(),
            page.slot_count()
        );
    }
    Ok(())
}

fn scan(path: &Path) -> Result<(), Box<dyn Error>> {
    let (store, file) = open_store_and_table(path)?;

    if file.page_count() == 0 {
        println!("0 tuple(s) scanned");
        return Ok(());
    }

    let tx = store.begin_tx();
    let mut scan = file.scan(tx);
    scan.open()?;
    let mut count = 0;
    while scan.has_next()? {
        println!("{}", scan.next()?);
        count += 1;
    }
    scan.close();
    store.release_transaction(tx);

    println!("{} tuple(s) scanned", count);
    Ok(())
}
