//! Shared helpers for process-level tests: scratch dirs and `/bin/sh` stubs.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use crate::config::{PipelineConfig, PlayerConfig, TranscoderConfig};
use crate::track::{Track, TrackTiming};

static SCRATCH_SEQ: AtomicU64 = AtomicU64::new(0);

/// Fresh, unique directory under the system temp dir.
pub(crate) fn scratch_dir(label: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!(
        "media-pipeline-{label}-{}-{}-{}",
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

/// Write a shell script; it is run as `/bin/sh <script>` so it never needs
/// the executable bit.
pub(crate) fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    path
}

/// Finds the `.part` target (argument after `-y`) and whether `-` is the last
/// argument (live stream requested).
const TRANSCODER_ARGS: &str = r#"part=""
prev=""
for a in "$@"; do
  if [ "$prev" = "-y" ]; then part="$a"; fi
  prev="$a"
done
"#;

/// Copies stdin into the part file (and stdout when live) then exits 0.
pub(crate) fn ok_transcoder(dir: &Path) -> TranscoderConfig {
    let body = format!(
        "{TRANSCODER_ARGS}if [ \"$prev\" = \"-\" ]; then tee \"$part\"; else cat > \"$part\"; fi\n"
    );
    sh_transcoder(write_script(dir, "transcoder-ok.sh", &body))
}

/// Like [`ok_transcoder`] but lingers after the copy, so it is observed running.
pub(crate) fn lingering_transcoder(dir: &Path, secs: u32) -> TranscoderConfig {
    let body = format!(
        "{TRANSCODER_ARGS}if [ \"$prev\" = \"-\" ]; then tee \"$part\"; else cat > \"$part\"; fi\nexec sleep {secs}\n"
    );
    sh_transcoder(write_script(dir, "transcoder-linger.sh", &body))
}

/// Writes a partial artifact and exits non-zero.
pub(crate) fn failing_transcoder(dir: &Path) -> TranscoderConfig {
    let body = format!("{TRANSCODER_ARGS}cat > \"$part\"\nexit 3\n");
    sh_transcoder(write_script(dir, "transcoder-fail.sh", &body))
}

/// Never finishes on its own.
pub(crate) fn hanging_transcoder(dir: &Path) -> TranscoderConfig {
    let body = format!("{TRANSCODER_ARGS}printf 'partial' > \"$part\"\nexec sleep 30\n");
    sh_transcoder(write_script(dir, "transcoder-hang.sh", &body))
}

fn sh_transcoder(script: PathBuf) -> TranscoderConfig {
    TranscoderConfig {
        program: PathBuf::from("/bin/sh"),
        extra_args: vec![script.to_string_lossy().to_string()],
        debug_output: false,
    }
}

/// Player stub: records its arguments to `<pipe>.args`, every command to
/// `<pipe>.log`, and answers the time/percent queries.
pub(crate) fn stub_player(dir: &Path) -> PlayerConfig {
    let body = r#"fifo=""
for a in "$@"; do
  case "$a" in file=*) fifo="${a#file=}";; esac
done
printf '%s\n' "$@" > "$fifo.args"
exec 3<>"$fifo"
while read -r cmd <&3; do
  printf '%s\n' "$cmd" >> "$fifo.log"
  case "$cmd" in
    get_time_pos) echo "ANS_TIME_POSITION=12.5";;
    get_percent_pos) echo "ANS_PERCENT_POSITION=40";;
    quit) exit 0;;
  esac
done
"#;
    sh_player(write_script(dir, "player.sh", body))
}

/// Player stub that answers every command with 25 lines of noise.
pub(crate) fn noisy_player(dir: &Path) -> PlayerConfig {
    let body = r#"fifo=""
for a in "$@"; do
  case "$a" in file=*) fifo="${a#file=}";; esac
done
exec 3<>"$fifo"
while read -r cmd <&3; do
  i=0
  while [ $i -lt 25 ]; do
    echo "noise line $i"
    i=$((i+1))
  done
done
"#;
    sh_player(write_script(dir, "player-noisy.sh", body))
}

fn sh_player(script: PathBuf) -> PlayerConfig {
    PlayerConfig {
        program: PathBuf::from("/bin/sh"),
        extra_args: vec![script.to_string_lossy().to_string()],
        ready_timeout: Duration::from_secs(5),
        ..PlayerConfig::default()
    }
}

pub(crate) fn pipeline_config(
    root: &Path,
    transcoder: TranscoderConfig,
    player: PlayerConfig,
) -> PipelineConfig {
    PipelineConfig {
        cache_dir: root.join("cache"),
        control_pipe: root.join("player.fifo"),
        transcoder,
        player,
    }
}

/// Poll `cond` until it holds or `timeout` passes.
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

/// Lines the stub player has received so far.
pub(crate) fn player_log(pipe: &Path) -> Vec<String> {
    let mut log = pipe.as_os_str().to_owned();
    log.push(".log");
    std::fs::read_to_string(PathBuf::from(log))
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}

/// Arguments the stub player was started with.
pub(crate) fn player_args(pipe: &Path) -> Vec<String> {
    let mut args = pipe.as_os_str().to_owned();
    args.push(".args");
    std::fs::read_to_string(PathBuf::from(args))
        .map(|s| s.lines().map(str::to_string).collect())
        .unwrap_or_default()
}
