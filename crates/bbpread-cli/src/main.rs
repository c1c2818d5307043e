use anyhow::{Context, bail};
use bbpread::{BatId, Bbp, Column};
use clap::Parser;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "bbpread", about = "Inspect a MonetDB farm's committed column store")]
pub struct Args {
    #[command(subcommand)]
    cmd: Command,
    /// Verbose diagnostics (repeat for trace)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, clap::Subcommand)]
pub enum Command {
    /// Print the parsed catalog header
    Header(FarmArgs),
    /// List the catalog's columns
    Info(FarmArgs),
    /// Print a column's values
    Dump(DumpArgs),
}

#[derive(Debug, clap::Args)]
pub struct FarmArgs {
    /// The farm directory
    farm: PathBuf,
}

#[derive(Debug, clap::Args)]
pub struct DumpArgs {
    /// The farm directory
    farm: PathBuf,
    /// Logical column name, or a numeric BAT id
    column: String,
    /// Print at most this many values
    #[arg(short, long)]
    limit: Option<u64>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    simple_logger::SimpleLogger::new()
        .with_level(match args.verbose {
            0 => log::LevelFilter::Warn,
            1 => log::LevelFilter::Debug,
            _ => log::LevelFilter::Trace,
        })
        .init()
        .unwrap();

    match args.cmd {
        Command::Header(a) => header(&a),
        Command::Info(a) => info(&a),
        Command::Dump(a) => dump(&a),
    }
}

fn header(args: &FarmArgs) -> anyhow::Result<()> {
    let bbp = Bbp::open(&args.farm)?;
    let h = bbp.header();
    println!("GDKversion   0{:o}", h.version);
    println!("pointer size {}", h.ptr_size);
    println!("oid size     {}", h.oid_size);
    println!("int size     {}", h.int_size);
    println!("oid seed     {}", h.oid_seed);
    if let Some(n) = h.bbp_size {
        println!("BBPsize      {n}");
    }
    println!("columns      {}", bbp.ids().count());
    Ok(())
}

fn info(args: &FarmArgs) -> anyhow::Result<()> {
    let mut bbp = Bbp::open(&args.farm)?;
    println!(
        "{:>6}  {:<24} {:<10} {:>12}  {:<6} {}",
        "id", "name", "type", "count", "flags", "file"
    );
    let ids: Vec<BatId> = bbp.ids().collect();
    for bid in ids {
        let (ttype, count, flags) = {
            let bat = bbp.quickdesc(bid)?;
            let mut flags = String::new();
            for (set, ch) in [
                (bat.sorted, 's'),
                (bat.revsorted, 'r'),
                (bat.key, 'k'),
                (bat.dense, 'd'),
                (bat.nonil, 'n'),
            ] {
                if set {
                    flags.push(ch);
                }
            }
            (bat.ttype, bat.count, flags)
        };
        println!(
            "{:>6}  {:<24} {:<10} {:>12}  {:<6} {}",
            bid,
            bbp.name_of(bid).unwrap_or("?"),
            bbp.atoms().name_of(ttype).unwrap_or("?"),
            count,
            flags,
            bbp.physical_of(bid).unwrap_or("")
        );
    }
    Ok(())
}

fn dump(args: &DumpArgs) -> anyhow::Result<()> {
    let mut bbp = Bbp::open(&args.farm)?;
    let bid = match args.column.parse::<i32>() {
        Ok(n) => BatId(n),
        Err(_) => bbp.find_by_name(&args.column),
    };
    if !bbp.valid(bid) {
        bail!("no column named {:?} in {}", args.column, args.farm.display());
    }
    let col: Column<'_> = bbp
        .descriptor(bid)
        .with_context(|| format!("loading column {}", args.column))?;
    let count = match args.limit {
        Some(limit) => col.count().min(limit),
        None => col.count(),
    };
    for pos in 0..count {
        println!("{}", col.format_at(pos)?);
    }
    if count < col.count() {
        eprintln!("... {} of {} values", count, col.count());
    }
    bbp.unfix(bid);
    Ok(())
}
