mod common;

use tokio::io::AsyncReadExt;

use pmoflacstream::{
    DecoderOptions, EncoderOptions, FlacError, MetadataBlock, MetadataKind, MetadataRequest,
    convert::convert_sample_width, decode_flac_file, decode_flac_stream, encode_flac_file,
    encode_flac_stream,
};

use common::{VecAsyncReader, decode_all, encode_all, format, synth_pcm};

#[tokio::test]
async fn roundtrip_4096_silent_frames_16_44() -> Result<(), FlacError> {
    let format = format(44_100, 2, 16);
    let pcm = vec![0u8; 4096 * 4];
    let flac = encode_all(pcm.clone(), EncoderOptions::with_format(format)).await?;
    assert_eq!(&flac[..4], b"fLaC");

    let mut stream = decode_flac_stream(VecAsyncReader::new(flac), DecoderOptions::default()).await?;
    let info = stream.format();
    assert_eq!(info.sample_rate, 44_100);
    assert_eq!(info.channels, 2);
    assert_eq!(info.bits_per_sample, 16);
    assert!(!info.is_32bit);

    let mut decoded = Vec::new();
    stream.read_to_end(&mut decoded).await?;
    assert_eq!(stream.progress().position, 4096);
    stream.wait().await?;

    assert_eq!(decoded, pcm);
    Ok(())
}

#[tokio::test]
async fn roundtrip_preserves_samples_across_bit_depths() -> Result<(), FlacError> {
    for (channels, bits) in [(1, 8), (2, 16), (2, 24), (3, 12)] {
        let format = format(48_000, channels, bits);
        let pcm = synth_pcm(10_000, format);
        let flac = encode_all(pcm.clone(), EncoderOptions::with_format(format)).await?;
        let (info, decoded) = decode_all(flac, DecoderOptions::default()).await?;
        assert_eq!(info.bits_per_sample, bits);
        assert_eq!(decoded.len() / info.pcm_bytes_per_frame(), 10_000);
        assert_eq!(decoded, pcm, "{channels} channels, {bits} bits");
    }
    Ok(())
}

#[tokio::test]
async fn output_as_32_sign_extends_24_bit_samples() -> Result<(), FlacError> {
    let format = format(96_000, 2, 24);
    let pcm = synth_pcm(3000, format);
    let flac = encode_all(pcm.clone(), EncoderOptions::with_format(format)).await?;

    let options = DecoderOptions {
        output_as_32: true,
        ..Default::default()
    };
    let (info, decoded) = decode_all(flac, options).await?;
    assert!(info.is_32bit);
    assert_eq!(info.pcm_bytes_per_frame(), 8);

    let expected = convert_sample_width(&pcm, 3, 4, 6000).unwrap();
    assert_eq!(decoded, expected);
    Ok(())
}

#[tokio::test]
async fn input_as_32_matches_packed_input() -> Result<(), FlacError> {
    let format = format(44_100, 2, 16);
    let packed = synth_pcm(5000, format);
    let wide = convert_sample_width(&packed, 2, 4, 10_000).unwrap();

    let reference = encode_all(packed, EncoderOptions::with_format(format)).await?;
    let options = EncoderOptions {
        input_as_32: true,
        ..EncoderOptions::with_format(format)
    };
    let from_wide = encode_all(wide, options).await?;
    assert_eq!(from_wide, reference);
    Ok(())
}

#[tokio::test]
async fn small_reads_produce_identical_output() -> Result<(), FlacError> {
    let format = format(44_100, 2, 16);
    let pcm = synth_pcm(9000, format);
    let reference = encode_all(pcm.clone(), EncoderOptions::with_format(format)).await?;

    let mut stream = encode_flac_stream(
        VecAsyncReader::with_step(pcm, 3),
        EncoderOptions::with_format(format),
    )
    .await?;
    let mut flac = Vec::new();
    stream.read_to_end(&mut flac).await?;
    let summary = stream.wait().await?;

    assert_eq!(flac, reference);
    assert_eq!(summary.samples, 9000);
    assert_eq!(summary.bytes_written, flac.len() as u64);
    let info = summary.stream_info.expect("stream encoder reports STREAMINFO");
    assert_eq!(info.total_samples, 9000);
    assert_ne!(info.md5, [0u8; 16]);
    Ok(())
}

#[tokio::test]
async fn vorbis_comments_reach_the_decoder() -> Result<(), FlacError> {
    let format = format(44_100, 2, 16);
    let options = EncoderOptions {
        metadata: vec![
            MetadataBlock::tags([("TITLE", "Streaming test"), ("ARTIST", "pmoflacstream")]),
            MetadataBlock::Padding { length: 256 },
        ],
        ..EncoderOptions::with_format(format)
    };
    let flac = encode_all(synth_pcm(2048, format), options).await?;

    let options = DecoderOptions {
        metadata: MetadataRequest::Only(vec![MetadataKind::VorbisComment]),
        ..Default::default()
    };
    let mut stream = decode_flac_stream(VecAsyncReader::new(flac), options).await?;
    let mut pcm = Vec::new();
    stream.read_to_end(&mut pcm).await?;

    let blocks = stream.metadata();
    assert_eq!(blocks.len(), 1);
    match &blocks[0] {
        MetadataBlock::VorbisComment { comments, .. } => {
            assert!(comments.contains(&("TITLE".into(), "Streaming test".into())));
            assert!(comments.contains(&("ARTIST".into(), "pmoflacstream".into())));
        }
        other => panic!("unexpected block {other:?}"),
    }
    stream.wait().await?;
    Ok(())
}

#[tokio::test]
async fn ogg_flac_roundtrip() -> Result<(), FlacError> {
    let format = format(22_050, 1, 16);
    let pcm = synth_pcm(6000, format);
    let options = EncoderOptions {
        is_ogg: true,
        ogg_serial_number: Some(7),
        ..EncoderOptions::with_format(format)
    };
    let ogg = encode_all(pcm.clone(), options).await?;
    assert_eq!(&ogg[..4], b"OggS");

    let options = DecoderOptions {
        is_ogg: true,
        ..Default::default()
    };
    let (info, decoded) = decode_all(ogg, options).await?;
    assert_eq!(info.channels, 1);
    assert_eq!(decoded, pcm);
    Ok(())
}

#[tokio::test]
async fn file_endpoints_roundtrip() -> Result<(), FlacError> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("sawtooth.flac");
    let format = format(44_100, 2, 24);
    let pcm = synth_pcm(12_345, format);

    let summary = encode_flac_file(
        VecAsyncReader::new(pcm.clone()),
        &path,
        EncoderOptions::with_format(format),
    )
    .await?;
    assert_eq!(summary.samples, 12_345);
    assert_eq!(summary.bytes_written, std::fs::metadata(&path)?.len());
    let info = summary.stream_info.expect("STREAMINFO read back from the file");
    assert_eq!(info.total_samples, 12_345);
    assert_eq!(info.bits_per_sample, 24);

    let options = DecoderOptions {
        md5_checking: true,
        ..Default::default()
    };
    let mut stream = decode_flac_file(&path, options).await?;
    assert_eq!(stream.format().total_samples, Some(12_345));
    let mut decoded = Vec::new();
    stream.read_to_end(&mut decoded).await?;
    let progress = stream.progress();
    assert_eq!(progress.position, 12_345);
    assert_eq!(progress.percentage, 100.0);
    stream.wait().await?;

    assert_eq!(decoded, pcm);
    Ok(())
}

#[tokio::test]
async fn missing_file_fails_at_open() {
    let dir = tempfile::tempdir().unwrap();
    let err = decode_flac_file(dir.path().join("absent.flac"), DecoderOptions::default())
        .await
        .err()
        .expect("opening a missing file must fail");
    assert!(matches!(err, FlacError::Init { .. }));
}

#[tokio::test]
async fn garbage_input_has_no_stream_info() {
    let garbage = (0..20_000u32).map(|i| (i % 7) as u8).collect::<Vec<_>>();
    let err = decode_flac_stream(VecAsyncReader::new(garbage), DecoderOptions::default())
        .await
        .err()
        .expect("garbage is not FLAC");
    assert!(matches!(err, FlacError::MissingStreamInfo));
}

#[tokio::test]
async fn invalid_options_are_rejected_before_encoding() {
    let options = EncoderOptions {
        compression_level: Some(5),
        tuning: pmoflacstream::EncoderTuning {
            max_lpc_order: Some(8),
            ..Default::default()
        },
        ..Default::default()
    };
    let err = encode_flac_stream(VecAsyncReader::new(Vec::new()), options)
        .await
        .err()
        .expect("level and tuning are exclusive");
    assert!(matches!(err, FlacError::InvalidOption(_)));
}
