//! Round trips through the on-disk weight format.
//!
//! Each test writes a file with [`WeightStore::save`] and reads it back,
//! checking the payload conversions the format performs on the way out:
//! raw f32, f16 narrowing, per-row int8/int4 quantization, and the bf16
//! embedding truncation. Corruption cases check the error taxonomy.

use kiln::{DType, EngineConfig, Error, Tensor, WeightKind, WeightStore};

fn le(buf: &mut Vec<u8>, v: i32) {
    buf.extend_from_slice(&v.to_le_bytes());
}

fn decode_f16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|c| half::f16::from_bits(u16::from_le_bytes([c[0], c[1]])).to_f32())
        .collect()
}

fn decode_bf16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|c| f32::from_bits(u32::from(u16::from_le_bytes([c[0], c[1]])) << 16))
        .collect()
}

#[test]
fn raw_f32_round_trips_with_vocab_and_metadata() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.bin");

    let values = [0.1f32, -0.2, 0.3, 1e-7, 1234.5, -0.0];
    let mut store = WeightStore::new(EngineConfig::default());
    store.insert("head.bias", Tensor::from_f32(&[2, 3], &values));
    store
        .metadata_mut()
        .insert("architecture".into(), "decoder".into());
    store
        .metadata_mut()
        .insert("hidden_size".into(), "2048".into());
    store.insert_vocab_entry(0, b"<s>".to_vec());
    // Bytes above 0x7F take the sign-extended path in the format.
    store.insert_vocab_entry(42, vec![0xC3, 0xA9]);
    store.save(&path, 16).unwrap();

    let mut loaded = WeightStore::new(EngineConfig::default());
    loaded.load_from_file(&path).unwrap();
    assert_eq!(loaded.version(), 1);
    assert_eq!(loaded.metadata()["architecture"], "decoder");
    assert_eq!(loaded.metadata()["hidden_size"], "2048");
    assert_eq!(loaded.vocab()[&0], b"<s>".to_vec());
    assert_eq!(loaded.vocab()[&42], vec![0xC3, 0xA9]);

    let t = loaded.get("head.bias").unwrap();
    assert_eq!(t.dtype(), DType::F32);
    assert_eq!(t.shape(), &[2, 3]);
    assert_eq!(t.as_f32().unwrap(), &values);
}

#[test]
fn linear_weights_narrow_to_f16_at_bit_16() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("w.bin");

    // Every value here is exactly representable in f16.
    let values = [0.5f32, -1.25, 3.0, 0.0078125];
    let mut w = Tensor::from_f32(&[2, 2], &values);
    w.weight_kind = WeightKind::Linear;
    let mut store = WeightStore::new(EngineConfig::default());
    store.insert("proj.weight", w);
    store.save(&path, 16).unwrap();

    let mut loaded = WeightStore::new(EngineConfig::default());
    loaded.load_from_file(&path).unwrap();
    let t = loaded.get("proj.weight").unwrap();
    assert_eq!(t.dtype(), DType::F16);
    assert_eq!(t.shape(), &[2, 2]);
    assert_eq!(decode_f16(t.host_bytes().unwrap()), values);
}

#[test]
fn linear_weights_quantize_per_row_at_bit_8() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("w.bin");

    #[rustfmt::skip]
    let values = [
         0.0f32,  0.5, 1.0, 1.5,
        -2.0,    -1.0, 0.0, 4.0,
    ];
    let mut w = Tensor::from_f32(&[2, 4], &values);
    w.weight_kind = WeightKind::Linear;
    let mut store = WeightStore::new(EngineConfig::default());
    store.insert("proj.weight", w);
    store.save(&path, 8).unwrap();

    let mut loaded = WeightStore::new(EngineConfig::default());
    loaded.load_from_file(&path).unwrap();
    let t = loaded.get("proj.weight").unwrap();
    assert_eq!(t.dtype(), DType::I8);
    assert_eq!(t.quant_axis(), 0);
    let configs = t.quant_configs();
    assert_eq!(configs.len(), 2);

    // Each code lands within half a step of the original value.
    let codes = t.host_bytes().unwrap();
    for r in 0..2 {
        let cfg = &configs[r];
        for c in 0..4 {
            let x = values[r * 4 + c];
            let back = cfg.dequantize(codes[r * 4 + c]);
            assert!(
                (back - x).abs() <= cfg.scale * 0.5 + 1e-6,
                "({r},{c}): {x} came back as {back}"
            );
        }
    }
}

#[test]
fn linear_weights_pack_nibble_codes_at_bit_4() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("w.bin");

    #[rustfmt::skip]
    let values = [
         0.0f32, 0.75, 1.5,
        -1.0,    0.5,  2.0,
    ];
    let mut w = Tensor::from_f32(&[2, 3], &values);
    w.weight_kind = WeightKind::Linear;
    let mut store = WeightStore::new(EngineConfig::default());
    store.insert("proj.weight", w);
    store.save(&path, 4).unwrap();

    let mut loaded = WeightStore::new(EngineConfig::default());
    loaded.load_from_file(&path).unwrap();
    let t = loaded.get("proj.weight").unwrap();
    assert_eq!(t.dtype(), DType::I4);
    assert_eq!(t.quant_axis(), 0);
    let configs = t.quant_configs();
    assert_eq!(configs.len(), 2);

    // Six codes pack into three bytes, high nibble first.
    let codes = t.host_bytes().unwrap();
    assert_eq!(codes.len(), 3);
    let code = |e: usize| {
        let b = codes[e / 2];
        if e % 2 == 0 {
            b >> 4
        } else {
            b & 0x0F
        }
    };
    for r in 0..2 {
        let cfg = &configs[r];
        for c in 0..3 {
            let x = values[r * 3 + c];
            let back = cfg.dequantize(code(r * 3 + c));
            assert!(
                (back - x).abs() <= cfg.scale * 0.5 + 1e-6,
                "({r},{c}): {x} came back as {back}"
            );
        }
    }
}

#[test]
fn embedding_tables_truncate_to_bf16() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("w.bin");

    // The third value rounds up under round-to-nearest; truncation keeps 1.0.
    let values = [1.0f32, -2.5, f32::from_bits(0x3F80_FFFF)];
    let mut w = Tensor::from_f32(&[1, 3], &values);
    w.weight_kind = WeightKind::Embedding;
    let mut store = WeightStore::new(EngineConfig::default());
    store.insert("tok.embed", w);
    store.save(&path, 16).unwrap();

    let mut loaded = WeightStore::new(EngineConfig::default());
    loaded.load_from_file(&path).unwrap();
    let t = loaded.get("tok.embed").unwrap();
    assert_eq!(t.dtype(), DType::BF16);
    let decoded = decode_bf16(t.host_bytes().unwrap());
    assert_eq!(decoded, [1.0, -2.5, 1.0]);
}

#[test]
fn saved_bytes_are_identical_across_pool_sizes() {
    let dir = tempfile::tempdir().unwrap();
    let values: Vec<f32> = (0..15).map(|i| (i as f32) * 0.21 - 1.3).collect();

    for bit in [4, 8] {
        let single = dir.path().join(format!("single-{bit}.bin"));
        let mut store = WeightStore::new(EngineConfig {
            threads: 1,
            ..EngineConfig::default()
        });
        let mut w = Tensor::from_f32(&[5, 3], &values);
        w.weight_kind = WeightKind::Linear;
        store.insert("proj.weight", w);
        store.save(&single, bit).unwrap();

        let pooled = dir.path().join(format!("pooled-{bit}.bin"));
        let mut store = WeightStore::new(EngineConfig {
            threads: 7,
            ..EngineConfig::default()
        });
        let mut w = Tensor::from_f32(&[5, 3], &values);
        w.weight_kind = WeightKind::Linear;
        store.insert("proj.weight", w);
        store.save(&pooled, bit).unwrap();

        assert_eq!(
            std::fs::read(&single).unwrap(),
            std::fs::read(&pooled).unwrap(),
            "bit {bit}"
        );
    }
}

#[test]
fn lazy_load_matches_eager_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.bin");
    let resaved = dir.path().join("resaved.bin");

    // bf16-exact values survive the embedding narrowing on re-save.
    let table = [1.0f32, -0.5, 2.0, 0.25, -3.0, 0.125];
    let other = [7.0f32, -7.0];
    let mut store = WeightStore::new(EngineConfig::default());
    store.insert("tok.embed", Tensor::from_f32(&[3, 2], &table));
    store.insert("head.bias", Tensor::from_f32(&[2], &other));
    store.save(&path, 16).unwrap();

    let mut eager = WeightStore::new(EngineConfig::default());
    eager.register_embedding("tok.embed");
    eager.load_from_file(&path).unwrap();
    let embed = eager.get("tok.embed").unwrap();
    assert!(embed.deferred().is_none());
    assert_eq!(embed.weight_kind, WeightKind::Embedding);

    let mut lazy = WeightStore::new(EngineConfig {
        low_mem: true,
        ..EngineConfig::default()
    });
    lazy.register_embedding("tok.embed");
    lazy.load_from_file(&path).unwrap();
    assert!(lazy.get("tok.embed").unwrap().deferred().is_some());
    assert!(lazy.get("head.bias").unwrap().deferred().is_none());

    // Saving pulls deferred payloads into memory first.
    lazy.save(&resaved, 16).unwrap();
    assert!(lazy.get("tok.embed").unwrap().deferred().is_none());
    for name in ["tok.embed", "head.bias"] {
        assert_eq!(
            lazy.get(name).unwrap().host_bytes().unwrap(),
            eager.get(name).unwrap().host_bytes().unwrap(),
            "{name}"
        );
    }

    let mut third = WeightStore::new(EngineConfig::default());
    third.load_from_file(&resaved).unwrap();
    let embed = third.get("tok.embed").unwrap();
    assert_eq!(embed.dtype(), DType::BF16);
    assert_eq!(decode_bf16(embed.host_bytes().unwrap()), table);
    assert_eq!(third.get("head.bias").unwrap().as_f32().unwrap(), &other);
}

#[test]
fn corrupt_files_report_typed_errors() {
    let dir = tempfile::tempdir().unwrap();

    // A file cut short fails with the position it ran out at.
    let full = dir.path().join("full.bin");
    let mut store = WeightStore::new(EngineConfig::default());
    store.insert("w", Tensor::from_f32(&[4, 4], &[0.5; 16]));
    store.save(&full, 16).unwrap();
    let bytes = std::fs::read(&full).unwrap();
    let cut = dir.path().join("cut.bin");
    std::fs::write(&cut, &bytes[..bytes.len() - 9]).unwrap();
    let mut reload = WeightStore::new(EngineConfig::default());
    match reload.load_from_file(&cut) {
        Err(Error::Truncated {
            needed, remaining, ..
        }) => assert!(remaining < needed),
        other => panic!("expected truncation, got {other:?}"),
    }

    // A dtype tag outside the format.
    let mut raw = Vec::new();
    le(&mut raw, 0); // version without a metadata table
    le(&mut raw, 0); // empty vocabulary
    le(&mut raw, 1); // one tensor
    le(&mut raw, 1);
    raw.push(b'w');
    le(&mut raw, 1); // rank
    le(&mut raw, 3); // dim
    le(&mut raw, 99); // no such tag
    let bad_tag = dir.path().join("tag.bin");
    std::fs::write(&bad_tag, &raw).unwrap();
    let mut reload = WeightStore::new(EngineConfig::default());
    assert!(matches!(
        reload.load_from_file(&bad_tag),
        Err(Error::UnsupportedDtype(_))
    ));

    // A negative table length.
    let mut raw = Vec::new();
    le(&mut raw, 1);
    le(&mut raw, -4);
    let bad_len = dir.path().join("len.bin");
    std::fs::write(&bad_len, &raw).unwrap();
    let mut reload = WeightStore::new(EngineConfig::default());
    assert!(matches!(
        reload.load_from_file(&bad_len),
        Err(Error::UnsupportedFormat(_))
    ));
}
