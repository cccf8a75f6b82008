//! End-to-end volume scenarios against real tempdir-backed storage.

use std::fs;
use std::path::Path;

use secrecy::SecretString;
use tempfile::tempdir;

use veilfs_core::{exitcodes, EngineError, HEADER_LEN};
use veilfs_crypto::kdf::SCRYPT_MIN_LOG_N;
use veilfs_crypto::AeadKind;
use veilfs_fs::{Volume, VolumeOptions};

fn password() -> SecretString {
    SecretString::from("correct horse battery staple")
}

fn fast_options() -> VolumeOptions {
    VolumeOptions {
        scrypt_log_n: Some(SCRYPT_MIN_LOG_N),
        ..VolumeOptions::default()
    }
}

fn init_and_open(dir: &Path, options: &VolumeOptions) -> Volume {
    Volume::init(dir, &password(), options).unwrap();
    Volume::open(dir, &password()).unwrap()
}

#[test]
fn scenario_write_unmount_remount_read() {
    let dir = tempdir().unwrap();
    let vol = init_and_open(dir.path(), &fast_options());

    let f = vol.create_file("greeting.txt").unwrap();
    f.write_at(0, b"hello\nworld").unwrap();
    drop(f);
    vol.unmount();

    let vol = Volume::open(dir.path(), &password()).unwrap();
    let f = vol.open_file("greeting.txt").unwrap();
    assert_eq!(f.read_at(0, 11).unwrap(), b"hello\nworld");
}

#[test]
fn scenario_bit_flip_on_backing_store_fails_auth() {
    let dir = tempdir().unwrap();
    let vol = init_and_open(dir.path(), &fast_options());

    let f = vol.create_file("a.txt").unwrap();
    f.write_at(0, &vec![0xABu8; 64 * 1024]).unwrap();
    drop(f);

    // Flip the 17th byte of the first block behind the engine's back.
    let cipher_path = dir.path().join(vol.encrypt_path("a.txt").unwrap());
    let mut raw = fs::read(&cipher_path).unwrap();
    raw[HEADER_LEN + 16] ^= 0x01;
    fs::write(&cipher_path, &raw).unwrap();
    vol.unmount();

    let vol = Volume::open(dir.path(), &password()).unwrap();
    let f = vol.open_file("a.txt").unwrap();
    let err = f.read_at(0, 64 * 1024).unwrap_err();
    assert!(err.is_corruption(), "{err}");
    assert_eq!(exitcodes::for_error(&err), exitcodes::CORRUPT_DATA);

    // Blocks after the corrupted one are still readable.
    let bs = vol.block_size() as u64;
    assert_eq!(f.read_at(bs, 100).unwrap(), vec![0xABu8; 100]);
}

#[test]
fn scenario_rename_across_directories_reencrypts_name() {
    let dir = tempdir().unwrap();
    let vol = init_and_open(dir.path(), &fast_options());

    vol.mkdir("src").unwrap();
    vol.mkdir("dst").unwrap();
    let f = vol.create_file("src/x").unwrap();
    f.write_at(0, b"data").unwrap();
    drop(f);

    let old_cipher = vol.encrypt_path("src/x").unwrap();
    vol.rename("src/x", "dst/x").unwrap();
    let new_cipher = vol.encrypt_path("dst/x").unwrap();

    assert_ne!(old_cipher.file_name(), new_cipher.file_name());
    assert_eq!(vol.read_dir("src").unwrap(), Vec::<String>::new());
    assert_eq!(vol.read_dir("dst").unwrap(), vec!["x"]);

    let f = vol.open_file("dst/x").unwrap();
    assert_eq!(f.read_at(0, 4).unwrap(), b"data");
}

#[test]
fn scenario_tampered_name_mac_hides_entry() {
    let dir = tempdir().unwrap();
    let options = VolumeOptions {
        filename_auth: true,
        ..fast_options()
    };
    let vol = init_and_open(dir.path(), &options);

    vol.create_file("alpha").unwrap();
    vol.create_file("beta").unwrap();
    assert_eq!(vol.read_dir("").unwrap(), vec!["alpha", "beta"]);

    // Change one base64 character inside alpha's MAC suffix on disk.
    let entry = vol.encrypt_path("alpha").unwrap();
    let name = entry.file_name().unwrap().to_str().unwrap().to_string();
    let (stem, mac) = name.rsplit_once('.').unwrap();
    let mut chars: Vec<char> = mac.chars().collect();
    chars[7] = if chars[7] == 'A' { 'B' } else { 'A' };
    let tampered: String = chars.into_iter().collect();
    fs::rename(
        dir.path().join(&name),
        dir.path().join(format!("{stem}.{tampered}")),
    )
    .unwrap();

    // The tampered entry is rejected; the other one survives.
    assert_eq!(vol.read_dir("").unwrap(), vec!["beta"]);
}

#[test]
fn scenario_straddling_write_after_restart() {
    let dir = tempdir().unwrap();
    let vol = init_and_open(dir.path(), &fast_options());

    let mut expected: Vec<u8> = (0..1024 * 1024u32).map(|i| (i % 241) as u8).collect();
    let f = vol.create_file("big").unwrap();
    f.write_at(0, &expected).unwrap();
    drop(f);
    vol.unmount();

    let vol = Volume::open(dir.path(), &password()).unwrap();
    let f = vol.open_file("big").unwrap();
    f.write_at(500_003, &[0x99]).unwrap();
    expected[500_003] = 0x99;

    assert_eq!(f.read_at(0, expected.len()).unwrap(), expected);
}

#[test]
fn scenario_weakened_kdf_params_refuse_to_mount() {
    let dir = tempdir().unwrap();
    Volume::init(dir.path(), &password(), &fast_options()).unwrap();

    let config = dir.path().join("gocryptfs.conf");
    let original = fs::read_to_string(&config).unwrap();
    let weakened = original.replace(
        &format!("\"log_n\": {SCRYPT_MIN_LOG_N}"),
        &format!("\"log_n\": {}", SCRYPT_MIN_LOG_N - 1),
    );
    assert_ne!(original, weakened);
    fs::write(&config, &weakened).unwrap();

    let err = Volume::open(dir.path(), &password()).unwrap_err();
    assert!(matches!(err, EngineError::WeakParameters(_)));
    assert_eq!(exitcodes::for_error(&err), exitcodes::WEAK_KDF_PARAMS);

    fs::write(&config, &original).unwrap();
    assert!(Volume::open(dir.path(), &password()).is_ok());
}

#[test]
fn test_all_block_sizes_roundtrip() {
    for bs in [4096u32, 16384, 32768, 65536] {
        let dir = tempdir().unwrap();
        let options = VolumeOptions {
            block_size: bs,
            ..fast_options()
        };
        let vol = init_and_open(dir.path(), &options);
        assert_eq!(vol.block_size(), bs);

        let data: Vec<u8> = (0..bs * 5 / 2).map(|i| (i % 253) as u8).collect();
        let f = vol.create_file("data.bin").unwrap();
        f.write_at(0, &data).unwrap();
        assert_eq!(f.read_at(0, data.len()).unwrap(), data, "bs={bs}");
    }
}

#[test]
fn test_wrong_password_is_distinct() {
    let dir = tempdir().unwrap();
    Volume::init(dir.path(), &password(), &fast_options()).unwrap();

    let err = Volume::open(dir.path(), &SecretString::from("nope")).unwrap_err();
    assert!(matches!(err, EngineError::WrongPassword));
    assert_eq!(exitcodes::for_error(&err), exitcodes::WRONG_PASSWORD);
}

#[test]
fn test_missing_config_exit_code() {
    let dir = tempdir().unwrap();
    let err = Volume::open(dir.path(), &password()).unwrap_err();
    assert_eq!(exitcodes::for_error(&err), exitcodes::CONFIG_MISSING);
}

#[test]
fn test_empty_file_stays_headerless_until_first_write() {
    let dir = tempdir().unwrap();
    let vol = init_and_open(dir.path(), &fast_options());

    let f = vol.create_file("empty").unwrap();
    let cipher_path = dir.path().join(vol.encrypt_path("empty").unwrap());
    assert_eq!(fs::metadata(&cipher_path).unwrap().len(), 0);

    f.write_at(0, b"x").unwrap();
    // Header plus one nonce+byte+tag block; the exact overhead depends
    // on the auto-selected AEAD.
    let len = fs::metadata(&cipher_path).unwrap().len();
    assert!(len > HEADER_LEN as u64, "len={len}");
    assert_eq!(f.read_at(0, 10).unwrap(), b"x");
}

#[test]
fn test_truncate_hole_survives_remount() {
    let dir = tempdir().unwrap();
    let vol = init_and_open(dir.path(), &fast_options());

    let f = vol.create_file("sparse").unwrap();
    f.write_at(0, b"head").unwrap();
    f.truncate(20_000).unwrap();
    drop(f);
    vol.unmount();

    let vol = Volume::open(dir.path(), &password()).unwrap();
    let f = vol.open_file("sparse").unwrap();
    assert_eq!(f.plain_size().unwrap(), 20_000);
    let all = f.read_at(0, 20_000).unwrap();
    assert_eq!(&all[..4], b"head");
    assert!(all[4..].iter().all(|&b| b == 0));
}

#[test]
fn test_long_names_spill_over() {
    let dir = tempdir().unwrap();
    let vol = init_and_open(dir.path(), &fast_options());

    let long = format!("{}.txt", "n".repeat(220));
    let f = vol.create_file(&long).unwrap();
    f.write_at(0, b"spilled").unwrap();
    drop(f);

    let stored = vol.encrypt_path(&long).unwrap();
    let stored_name = stored.file_name().unwrap().to_str().unwrap().to_string();
    assert!(stored_name.starts_with("gocryptfs.longname."));
    assert!(dir
        .path()
        .join(format!("{stored_name}.name"))
        .exists());

    assert_eq!(vol.read_dir("").unwrap(), vec![long.clone()]);
    let f = vol.open_file(&long).unwrap();
    assert_eq!(f.read_at(0, 7).unwrap(), b"spilled");

    vol.unlink(&long).unwrap();
    assert!(vol.read_dir("").unwrap().is_empty());
    assert!(!dir.path().join(format!("{stored_name}.name")).exists());
}

#[test]
fn test_consistency_check_finds_orphans() {
    let dir = tempdir().unwrap();
    let vol = init_and_open(dir.path(), &fast_options());

    let long = "o".repeat(240);
    vol.create_file(&long).unwrap();
    vol.mkdir("subdir").unwrap();
    assert!(vol.check().unwrap().is_empty());

    // Orphan the stub and strip a directory IV.
    let stub = vol.encrypt_path(&long).unwrap();
    let companion = dir.path().join(format!(
        "{}.name",
        stub.file_name().unwrap().to_str().unwrap()
    ));
    fs::remove_file(&companion).unwrap();
    let subdir = dir.path().join(vol.encrypt_path("subdir").unwrap());
    fs::remove_file(subdir.join("gocryptfs.diriv")).unwrap();

    let issues = vol.check().unwrap();
    let problems: Vec<&str> = issues.iter().map(|i| i.problem.as_str()).collect();
    assert!(problems.iter().any(|p| p.contains("stub without companion")), "{problems:?}");
    assert!(problems.iter().any(|p| p.contains("missing gocryptfs.diriv")), "{problems:?}");
}

#[test]
fn test_change_password_end_to_end() {
    let dir = tempdir().unwrap();
    let vol = init_and_open(dir.path(), &fast_options());
    let f = vol.create_file("keepsake").unwrap();
    f.write_at(0, b"still here").unwrap();
    drop(f);

    let new_pw = SecretString::from("a different passphrase");
    vol.change_password(&password(), &new_pw).unwrap();
    vol.unmount();

    assert!(matches!(
        Volume::open(dir.path(), &password()),
        Err(EngineError::WrongPassword)
    ));
    let vol = Volume::open(dir.path(), &new_pw).unwrap();
    let f = vol.open_file("keepsake").unwrap();
    assert_eq!(f.read_at(0, 10).unwrap(), b"still here");
}

#[cfg(unix)]
#[test]
fn test_symlink_target_is_encrypted() {
    let dir = tempdir().unwrap();
    let vol = init_and_open(dir.path(), &fast_options());

    vol.symlink("../secret/target", "link").unwrap();
    assert_eq!(vol.readlink("link").unwrap(), "../secret/target");

    // The raw link target on the backing store reveals nothing.
    let cipher = dir.path().join(vol.encrypt_path("link").unwrap());
    let raw = fs::read_link(cipher).unwrap();
    assert_ne!(raw.to_str().unwrap(), "../secret/target");
    assert!(!raw.to_str().unwrap().contains("secret"));
}

#[test]
fn test_plaintext_names_volume_still_encrypts_content() {
    let dir = tempdir().unwrap();
    let options = VolumeOptions {
        plaintext_names: true,
        ..fast_options()
    };
    let vol = init_and_open(dir.path(), &options);

    let f = vol.create_file("visible.txt").unwrap();
    f.write_at(0, b"top secret contents").unwrap();
    drop(f);

    assert!(dir.path().join("visible.txt").exists());
    let raw = fs::read(dir.path().join("visible.txt")).unwrap();
    assert!(!raw
        .windows(b"top secret".len())
        .any(|w| w == b"top secret"));
    assert_eq!(vol.read_dir("").unwrap(), vec!["visible.txt"]);
}

#[test]
fn test_siv_volume_roundtrip() {
    let dir = tempdir().unwrap();
    let options = VolumeOptions {
        aead: Some(AeadKind::AesSiv),
        ..fast_options()
    };
    let vol = init_and_open(dir.path(), &options);

    let f = vol.create_file("reverse").unwrap();
    f.write_at(0, b"deterministic world").unwrap();
    assert_eq!(f.read_at(0, 19).unwrap(), b"deterministic world");
}

#[test]
fn test_path_hooks_roundtrip() {
    let dir = tempdir().unwrap();
    let vol = init_and_open(dir.path(), &fast_options());

    vol.mkdir("a").unwrap();
    vol.mkdir("a/b").unwrap();
    vol.create_file("a/b/c.txt").unwrap();

    let cipher_rel = vol.encrypt_path("a/b/c.txt").unwrap();
    let plain = vol
        .decrypt_path(cipher_rel.to_str().unwrap())
        .unwrap();
    assert_eq!(plain, Path::new("a/b/c.txt"));
}
