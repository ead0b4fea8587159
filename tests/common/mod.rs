#![allow(dead_code)]

use heybro::actions::ActionContext;
use heybro::backends::{
    AudioBackend, InputStream, ModelProvider, OutputSink, SpeechBackend, SpeechRecognizer,
    SttModel, WakeEngine, Waveform,
};
use heybro::cortex::Cortex;
use heybro::custom_actions::CustomActionMap;
use heybro::device::AudioDevice;
use heybro::dispatcher::{
    Collaborators, Dispatcher, PipelineHandle, PipelineOptions, PipelineStatus,
};
use heybro::platform::{CallState, InstalledApp, Permission, Platform};
use heybro::profiles::Language;
use heybro::{Error, Result};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tokio::task::JoinHandle;

mockall::mock! {
    pub Platform {}
    impl Platform for Platform {
        fn launch_app(&self, package: &str) -> Result<()>;
        fn open_url(&self, url: &str) -> Result<()>;
        fn can_open(&self, url: &str) -> bool;
        fn send_action(&self, package: &str, action: &str) -> Result<()>;
        fn has_permission(&self, permission: Permission) -> bool;
        fn start_call(&self, number: &str) -> Result<()>;
        fn call_state(&self) -> Result<CallState>;
        fn open_accessibility_settings(&self) -> Result<()>;
        fn installed_apps(&self) -> Result<Vec<InstalledApp>>;
        fn pick_app(&self, prompt: &str, apps: &[InstalledApp]) -> Result<Option<InstalledApp>>;
    }
}

/// Counts open streams so tests can check the device was never shared
#[derive(Default)]
pub struct StreamCounter {
    open: AtomicUsize,
    max_open: AtomicUsize,
}

impl StreamCounter {
    pub fn max_open(&self) -> usize {
        self.max_open.load(Ordering::SeqCst)
    }

    pub fn open(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

struct StreamTrack(Arc<StreamCounter>);

impl StreamTrack {
    fn new(counter: &Arc<StreamCounter>) -> Self {
        let now = counter.open.fetch_add(1, Ordering::SeqCst) + 1;
        counter.max_open.fetch_max(now, Ordering::SeqCst);
        Self(counter.clone())
    }
}

impl Drop for StreamTrack {
    fn drop(&mut self) {
        self.0.open.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Silent microphone and a speaker that just records what it was given
#[derive(Default)]
pub struct FakeAudio {
    pub streams: Arc<StreamCounter>,
    pub played: Arc<Mutex<Vec<Waveform>>>,
    pub fail_input: AtomicBool,
}

impl AudioBackend for FakeAudio {
    fn open_input(&self, _sample_rate: u32) -> Result<Box<dyn InputStream>> {
        if self.fail_input.load(Ordering::SeqCst) {
            return Err(Error::DeviceUnavailable("microphone unplugged".into()));
        }
        Ok(Box::new(FakeInput {
            _track: StreamTrack::new(&self.streams),
        }))
    }

    fn open_output(&self) -> Result<Box<dyn OutputSink>> {
        Ok(Box::new(FakeOutput {
            _track: StreamTrack::new(&self.streams),
            played: self.played.clone(),
        }))
    }
}

struct FakeInput {
    _track: StreamTrack,
}

impl InputStream for FakeInput {
    fn read_frame(&mut self, frame: &mut [i16], _timeout: Duration) -> Result<bool> {
        thread::sleep(Duration::from_millis(2));
        frame.fill(0);
        Ok(true)
    }
}

struct FakeOutput {
    _track: StreamTrack,
    played: Arc<Mutex<Vec<Waveform>>>,
}

impl OutputSink for FakeOutput {
    fn play(&mut self, waveform: &Waveform, stop: &AtomicBool) -> Result<()> {
        self.played.lock().unwrap().push(waveform.clone());
        for _ in 0..5 {
            if stop.load(Ordering::SeqCst) {
                break;
            }
            thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }
}

/// Recognizer that hears the utterance end after a couple of blocks,
/// or never when `endless`
struct ScriptedRecognizer {
    text: String,
    blocks: usize,
    endless: bool,
}

impl SpeechRecognizer for ScriptedRecognizer {
    fn accept(&mut self, _pcm: &[i16]) -> Result<bool> {
        self.blocks += 1;
        Ok(!self.endless && self.blocks >= 2)
    }

    fn final_text(&mut self) -> String {
        self.text.clone()
    }
}

struct ScriptedStt {
    transcripts: Arc<Mutex<VecDeque<String>>>,
    endless: Arc<AtomicBool>,
}

impl SttModel for ScriptedStt {
    fn recognizer(&self, _sample_rate: u32) -> Result<Box<dyn SpeechRecognizer>> {
        let text = self.transcripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedRecognizer {
            text,
            blocks: 0,
            endless: self.endless.load(Ordering::SeqCst),
        }))
    }
}

struct RecordingVoice {
    id: String,
    spoken: Arc<Mutex<Vec<String>>>,
    delay_ms: Arc<AtomicU64>,
}

impl SpeechBackend for RecordingVoice {
    fn synthesize(&self, text: &str) -> Result<Waveform> {
        self.spoken.lock().unwrap().push(text.to_string());
        thread::sleep(Duration::from_millis(self.delay_ms.load(Ordering::SeqCst)));
        Ok(Waveform {
            samples: vec![0; 160],
            sample_rate: 16000,
            channels: 1,
        })
    }

    fn id(&self) -> &str {
        &self.id
    }
}

/// Fires once per pending trigger
struct TriggeredWake {
    triggers: Arc<AtomicUsize>,
}

impl WakeEngine for TriggeredWake {
    fn frame_length(&self) -> usize {
        160
    }

    fn process(&mut self, _pcm: &[i16]) -> bool {
        self.triggers
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Clone, Default)]
pub struct FakeModels {
    pub transcripts: Arc<Mutex<VecDeque<String>>>,
    pub spoken: Arc<Mutex<Vec<String>>>,
    pub wake_triggers: Arc<AtomicUsize>,
    pub broken: Arc<Mutex<HashSet<Language>>>,
    pub wake_broken: Arc<AtomicBool>,
    /// Capture never hears the end of the utterance
    pub endless_capture: Arc<AtomicBool>,
    pub synth_delay_ms: Arc<AtomicU64>,
}

impl FakeModels {
    pub fn hear(&self, text: &str) {
        self.transcripts.lock().unwrap().push_back(text.to_string());
    }

    pub fn say_wake_word(&self) {
        self.wake_triggers.fetch_add(1, Ordering::SeqCst);
    }

    pub fn break_language(&self, language: Language) {
        self.broken.lock().unwrap().insert(language);
    }

    pub fn spoken(&self) -> Vec<String> {
        self.spoken.lock().unwrap().clone()
    }
}

impl ModelProvider for FakeModels {
    fn load_stt(&self, language: Language) -> Result<Arc<dyn SttModel>> {
        if self.broken.lock().unwrap().contains(&language) {
            return Err(Error::InitializationFailed(format!(
                "no {} model",
                language
            )));
        }
        Ok(Arc::new(ScriptedStt {
            transcripts: self.transcripts.clone(),
            endless: self.endless_capture.clone(),
        }))
    }

    fn load_tts(&self, language: Language) -> Result<Arc<dyn SpeechBackend>> {
        Ok(Arc::new(RecordingVoice {
            id: format!("fake-{}", language),
            spoken: self.spoken.clone(),
            delay_ms: self.synth_delay_ms.clone(),
        }))
    }

    fn load_wake(&self, _sensitivity: f32) -> Result<Box<dyn WakeEngine>> {
        if self.wake_broken.load(Ordering::SeqCst) {
            return Err(Error::InitializationFailed("no wake model".into()));
        }
        Ok(Box::new(TriggeredWake {
            triggers: self.wake_triggers.clone(),
        }))
    }
}

pub struct Rig {
    pub handle: PipelineHandle,
    pub task: JoinHandle<()>,
    pub models: FakeModels,
    pub audio: Arc<FakeAudio>,
    pub device: AudioDevice,
    pub custom_actions: CustomActionMap,
}

impl Rig {
    pub async fn shutdown(self) {
        self.handle.shutdown().unwrap();
        self.task.await.unwrap();
    }
}

pub fn options() -> PipelineOptions {
    PipelineOptions {
        capture_block: Duration::from_millis(20),
        capture_max: Duration::from_secs(2),
        ..PipelineOptions::default()
    }
}

pub fn rig(cortex: Cortex, platform: Option<Arc<dyn Platform>>, models: FakeModels) -> Rig {
    let audio = Arc::new(FakeAudio::default());
    let device = AudioDevice::new(audio.clone());
    let custom_actions = CustomActionMap::in_memory();

    let (handle, task) = Dispatcher::spawn(
        options(),
        Collaborators {
            device: device.clone(),
            models: Arc::new(models.clone()),
            cortex,
            actions: ActionContext {
                platform,
                custom_actions: custom_actions.clone(),
                vpn_package: "com.example.vpn".into(),
            },
        },
    );

    Rig {
        handle,
        task,
        models,
        audio,
        device,
        custom_actions,
    }
}

pub async fn wait_until<F>(handle: &PipelineHandle, pred: F) -> PipelineStatus
where
    F: FnMut(&PipelineStatus) -> bool,
{
    tokio::time::timeout(Duration::from_secs(10), handle.wait_for(pred))
        .await
        .expect("timed out waiting for pipeline")
        .expect("pipeline stopped")
}

pub fn logged(status: &PipelineStatus, line: &str) -> bool {
    status.log.iter().any(|l| l == line)
}

/// An NLU server that accepts connections and never answers
pub async fn silent_server() -> (String, JoinHandle<()>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let task = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    (format!("http://{}", addr), task)
}
