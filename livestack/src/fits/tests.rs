use std::path::PathBuf;

use fitsio::images::WriteImage;

use super::*;

/// Creates `name` in `dir` with an integer or float primary image and the keys a light
/// frame needs, then lets `extra` add or override cards.
fn write_fixture<T: WriteImage>(
    dir: &Path,
    name: &str,
    data_type: ImageType,
    shape: &[usize],
    data: &[T],
    extra: impl FnOnce(&FitsHdu, &mut FitsFile),
) -> PathBuf {
    let path = dir.join(name);
    let description = ImageDescription {
        data_type,
        dimensions: shape,
    };
    let mut fptr = FitsFile::create(&path)
        .with_custom_primary(&description)
        .open()
        .unwrap();
    let hdu = fptr.primary_hdu().unwrap();
    hdu.write_image(&mut fptr, data).unwrap();
    hdu.write_key(&mut fptr, "INSTRUME", "CamA").unwrap();
    hdu.write_key(&mut fptr, "EXPTIME", 30.0f64).unwrap();
    hdu.write_key(&mut fptr, "GAIN", 100i64).unwrap();
    hdu.write_key(&mut fptr, "CCD-TEMP", -10.2f64).unwrap();
    hdu.write_key(&mut fptr, "IMAGETYP", "Light Frame").unwrap();
    extra(&hdu, &mut fptr);
    path
}

fn assert_close(actual: &[f32], expected: &[f32]) {
    assert_eq!(actual.len(), expected.len());
    for (i, (a, e)) in actual.iter().zip(expected).enumerate() {
        assert!((a - e).abs() < 1e-6, "sample {i}: {a} != {e}");
    }
}

#[test]
fn read_unsigned_16_bit_scales_by_full_range() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_fixture(
        tmp.path(),
        "u16.fits",
        ImageType::UnsignedShort,
        &[1, 3],
        &[0u16, 32768, 65535],
        |_, _| {},
    );

    let frame = FitsCodec.read(&path).unwrap();

    assert_eq!(frame.pixels.dims(), ImageDimensions::new(3, 1, 1));
    assert_close(frame.pixels.data(), &[0.0, 32768.0 / 65535.0, 1.0]);
}

#[test]
fn read_8_bit_scales_by_full_range() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_fixture(
        tmp.path(),
        "u8.fits",
        ImageType::UnsignedByte,
        &[2, 2],
        &[0u8, 51, 255, 102],
        |_, _| {},
    );

    let frame = FitsCodec.read(&path).unwrap();

    assert_close(frame.pixels.data(), &[0.0, 0.2, 1.0, 0.4]);
}

#[test]
fn read_float_passes_through_and_zeroes_nulls() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_fixture(
        tmp.path(),
        "float.fits",
        ImageType::Float,
        &[1, 4],
        &[0.25f32, 1.5, f32::NAN, -0.5],
        |_, _| {},
    );

    let frame = FitsCodec.read(&path).unwrap();

    assert_eq!(frame.pixels.data(), &[0.25, 1.5, 0.0, -0.5]);
}

#[test]
fn read_metadata_from_cards() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_fixture(
        tmp.path(),
        "meta.fits",
        ImageType::UnsignedByte,
        &[1, 1],
        &[7u8],
        |hdu, fptr| {
            hdu.write_key(fptr, "OBJECT", "M31").unwrap();
            hdu.write_key(fptr, "BAYERPAT", "RGGB").unwrap();
            hdu.write_key(fptr, "SUBCOUNT", 4i64).unwrap();
        },
    );

    let frame = FitsCodec.read(&path).unwrap();

    assert_eq!(
        frame.metadata,
        FrameMetadata {
            camera: "CamA".to_string(),
            exposure: 30.0,
            gain: 100,
            temperature: -10.2,
            image_type: "Light Frame".to_string(),
            target: Some("M31".to_string()),
            filter: None,
            bayer_pattern: Some("RGGB".to_string()),
            sample_count: Some(4),
        }
    );
}

#[test]
fn read_uses_fallback_keywords_and_gain_default() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("fallback.fits");
    let description = ImageDescription {
        data_type: ImageType::UnsignedByte,
        dimensions: &[1, 1],
    };
    let mut fptr = FitsFile::create(&path)
        .with_custom_primary(&description)
        .open()
        .unwrap();
    let hdu = fptr.primary_hdu().unwrap();
    hdu.write_image(&mut fptr, &[0u8]).unwrap();
    hdu.write_key(&mut fptr, "INSTRUME", "CamA").unwrap();
    hdu.write_key(&mut fptr, "EXPTIME", 60i64).unwrap();
    hdu.write_key(&mut fptr, "CCDTEMP", -5.0f64).unwrap();
    hdu.write_key(&mut fptr, "FRAME", "Dark").unwrap();
    drop(fptr);

    let frame = FitsCodec.read(&path).unwrap();

    assert_eq!(frame.metadata.gain, 0);
    assert_eq!(frame.metadata.temperature, -5.0);
    assert_eq!(frame.metadata.exposure, 60.0);
    assert_eq!(frame.metadata.image_type, "Dark");
    assert_eq!(frame.metadata.sample_count, None);
}

#[test]
fn read_rejects_unsupported_dimensionality() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_fixture(
        tmp.path(),
        "line.fits",
        ImageType::UnsignedByte,
        &[4],
        &[0u8, 0, 0, 0],
        |_, _| {},
    );

    assert!(matches!(
        FitsCodec.read(&path),
        Err(CodecError::UnsupportedDimensions(1))
    ));
}

#[test]
fn read_rejects_missing_camera() {
    let tmp = tempfile::tempdir().unwrap();
    let path = write_fixture(
        tmp.path(),
        "anonymous.fits",
        ImageType::UnsignedByte,
        &[1, 1],
        &[0u8],
        |hdu, fptr| hdu.write_key(fptr, "INSTRUME", "   ").unwrap(),
    );

    assert!(matches!(
        FitsCodec.read(&path),
        Err(CodecError::MissingKey("INSTRUME"))
    ));
}

#[test]
fn read_rejects_non_fits() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("image.fits");
    fs::write(&path, b"\x89PNG\r\n\x1a\n").unwrap();

    assert!(matches!(FitsCodec.read(&path), Err(CodecError::Fits(_))));
}

#[test]
fn written_composite_preserves_planes_and_setup() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("composite.fits");
    let dims = ImageDimensions::new(3, 2, 3);
    let data: Vec<f32> = (0..dims.sample_count()).map(|v| v as f32 / 20.0).collect();
    let metadata = FrameMetadata {
        camera: "CamA".to_string(),
        exposure: 120.25,
        gain: 100,
        temperature: -10.0,
        image_type: "Light Frame".to_string(),
        target: Some("M31".to_string()),
        filter: Some("NONE".to_string()),
        bayer_pattern: None,
        sample_count: Some(12),
    };
    let frame = Frame {
        metadata: metadata.clone(),
        pixels: PixelBuffer::new(dims, data.clone()),
    };

    FitsCodec.write(&frame, &path).unwrap();
    let read = FitsCodec.read(&path).unwrap();

    assert_eq!(read.metadata, metadata);
    assert_eq!(read.pixels.dims(), dims);
    assert_eq!(read.pixels.data(), data.as_slice());
    assert_eq!(read.pixels.plane(2)[0], 12.0 / 20.0);
}

#[test]
fn write_replaces_existing_file() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("composite.fits");
    fs::write(&path, b"stale").unwrap();
    let frame = Frame {
        metadata: FrameMetadata {
            camera: "CamA".to_string(),
            exposure: 30.0,
            temperature: -10.0,
            image_type: "Dark Frame".to_string(),
            ..FrameMetadata::default()
        },
        pixels: PixelBuffer::filled(ImageDimensions::new(2, 2, 1), 0.5),
    };

    FitsCodec.write(&frame, &path).unwrap();

    assert_eq!(FitsCodec.read(&path).unwrap().pixels, frame.pixels);
}

#[test]
fn write_rejects_non_finite_exposure() {
    let tmp = tempfile::tempdir().unwrap();
    let path = tmp.path().join("composite.fits");
    let frame = Frame {
        metadata: FrameMetadata {
            camera: "CamA".to_string(),
            exposure: f64::NAN,
            image_type: "Dark Frame".to_string(),
            ..FrameMetadata::default()
        },
        pixels: PixelBuffer::filled(ImageDimensions::new(2, 2, 1), 0.5),
    };

    assert!(matches!(
        FitsCodec.write(&frame, &path),
        Err(CodecError::InvalidValue { key: "EXPTIME", .. })
    ));
    assert!(!path.exists());
}
