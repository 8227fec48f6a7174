//! Prints header cards, decoded metadata and derived composite keys for every FITS file
//! below a directory.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use common::file_utils::{files_with_extensions_recursive, FITS_EXTENSIONS};
use livestack::capabilities::FrameCodec;
use fitsio::hdu::HduInfo;
use fitsio::FitsFile;
use livestack::fits::FitsCodec;
use livestack::keyer::classify;

fn main() -> Result<()> {
    let dir = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .ok_or_else(|| anyhow!("usage: analyze <directory>"))?;

    let files = files_with_extensions_recursive(&dir, FITS_EXTENSIONS);
    if files.is_empty() {
        println!("no FITS files below {}", dir.display());
    }
    for path in files {
        if let Err(err) = analyze(&path) {
            println!("{}: {err:#}", path.display());
        }
        println!();
    }
    Ok(())
}

/// Cards the codec reads, printed as found in the file.
const CARDS: &[&str] = &[
    "BITPIX", "BZERO", "BSCALE", "INSTRUME", "IMAGETYP", "FRAME", "EXPTIME", "GAIN", "CCD-TEMP",
    "CCDTEMP", "OBJECT", "FILTER", "BAYERPAT", "SUBCOUNT",
];

fn analyze(path: &Path) -> Result<()> {
    let mut fptr = FitsFile::open(path)
        .with_context(|| format!("Failed to open FITS file: {}", path.display()))?;
    let hdu = fptr.primary_hdu().context("Failed to access primary HDU")?;

    println!("== {}", path.display());
    if let HduInfo::ImageInfo { shape, image_type } = &hdu.info {
        println!("  shape        {shape:?} ({image_type:?})");
    }
    for keyword in CARDS {
        if let Ok(value) = hdu.read_key::<String>(&mut fptr, keyword) {
            println!("  {keyword:<8} = {value}");
        }
    }
    drop(fptr);

    let frame = FitsCodec.read(path)?;
    let metadata = &frame.metadata;
    println!("  dimensions   {}", frame.pixels.dims());
    println!("  camera       {}", metadata.camera);
    println!("  exposure     {}", metadata.exposure);
    println!("  gain         {}", metadata.gain);
    println!("  temperature  {}", metadata.temperature);
    println!("  image type   {}", metadata.image_type);

    let classification = classify(metadata)?;
    println!("  role         {}", classification.role());
    let none = "-".to_string();
    let show = |key: &Option<livestack::keyer::CompositeKey>| {
        key.as_ref().map_or_else(|| none.clone(), |key| key.to_string())
    };
    println!("  key          {}", show(&classification.key));
    println!("  dark key     {}", show(&classification.dark_key));
    println!("  flat key     {}", show(&classification.flat_key));
    Ok(())
}
