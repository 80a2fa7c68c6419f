//! Scratch dirs, sample tracks and `/bin/sh` stand-ins for the external tools.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use media_pipeline::config::{PipelineConfig, PlayerConfig, TranscoderConfig};
use media_pipeline::track::{Track, TrackTiming};

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

pub(crate) fn scratch_dir(label: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "openplug-{label}-{}-{}-{}",
        std::process::id(),
        SCRATCH_SEQ.fetch_add(1, Ordering::Relaxed),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos()
    ));
    std::fs::create_dir_all(&root).unwrap();
    root
}

pub(crate) fn sample_track(id: i64, artist: &str, title: &str) -> Track {
    Track {
        id,
        title: title.to_string(),
        artist: artist.to_string(),
        length_seconds: Some(180),
        file_size_bytes: None,
        source_url: format!("https://example/{id}"),
        timing: TrackTiming {
            song_start_time: 100.0,
            requested_time: 130.0,
        },
    }
}

pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// Copies stdin to the `-y` target (and stdout when the last arg is `-`),
/// then stays alive for a second so the decode is observed running.
const TRANSCODER: &str = r#"part=""
prev=""
for a in "$@"; do
  if [ "$prev" = "-y" ]; then part="$a"; fi
  prev="$a"
done
if [ "$prev" = "-" ]; then tee "$part"; else cat > "$part"; fi
exec sleep 1
"#;

/// Reads commands from its `file=` pipe until told to quit.
const PLAYER: &str = r#"fifo=""
for a in "$@"; do
  case "$a" in file=*) fifo="${a#file=}";; esac
done
exec 3<>"$fifo"
while read -r cmd <&3; do
  case "$cmd" in
    get_time_pos) echo "ANS_TIME_POSITION=1.0";;
    get_percent_pos) echo "ANS_PERCENT_POSITION=1";;
    quit) exit 0;;
  esac
done
"#;

pub(crate) fn pipeline_config(root: &Path) -> PipelineConfig {
    let transcoder = write_script(root, "transcoder.sh", TRANSCODER);
    let player = write_script(root, "player.sh", PLAYER);
    PipelineConfig {
        cache_dir: root.join("cache"),
        control_pipe: root.join("player.fifo"),
        transcoder: TranscoderConfig {
            program: PathBuf::from("/bin/sh"),
            extra_args: vec![transcoder.to_string_lossy().to_string()],
            debug_output: false,
        },
        player: PlayerConfig {
            program: PathBuf::from("/bin/sh"),
            extra_args: vec![player.to_string_lossy().to_string()],
            ready_timeout: Duration::from_secs(5),
            ..PlayerConfig::default()
        },
    }
}

pub(crate) fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    cond()
}
