//! Station catalog and the fixed channel roster.
//!
//! A stream channel with a single station is a fixed relay; with several it
//! offers a sub-station picker. The live-capture channel has no stations.

use serde::{Deserialize, Serialize};

const R1_CV: &str = "https://rnelivestream.rtve.es/rne1/val/master.m3u8";
const ONDA_CERO_ALI: &str =
    "https://atres-live.ondacero.es/live/delegaciones/oc/alicante/master.m3u8";
const R5_ALI: &str = "https://rnelivestream.rtve.es/rne5/ali/master.m3u8";
const COPE_ALI: &str = "https://alicante-copesedes-rrcast.flumotion.com/copesedes/alicante.mp3";
const SER_ALI: &str =
    "https://playerservices.streamtheworld.com/api/livestream-redirect/SER_ALICANTEAAC.aac";
const ES_RADIO: &str = "https://sonic.mediatelekom.net/8274/stream";
const RADIO_MARCA: &str =
    "http://relay.stream.enacast-cloud.com:8000/marcalinkdelegaciones256.mp3";
const RADIO_ESPANA: &str = "https://stream-151.zeno.fm/7ywx2u45vv8uv";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    /// Local capture device (microphone, line in).
    Live,
    /// Network radio stream.
    Stream,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Station {
    pub name: String,
    pub url: String,
}

impl Station {
    pub fn new(name: &str, url: &str) -> Self {
        Station {
            name: name.to_string(),
            url: url.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    pub id: String,
    pub label: String,
    pub kind: ChannelKind,
    #[serde(default)]
    pub stations: Vec<Station>,
}

impl ChannelConfig {
    pub fn live(id: &str, label: &str) -> Self {
        ChannelConfig {
            id: id.to_string(),
            label: label.to_string(),
            kind: ChannelKind::Live,
            stations: Vec::new(),
        }
    }

    pub fn stream(id: &str, label: &str, stations: Vec<Station>) -> Self {
        ChannelConfig {
            id: id.to_string(),
            label: label.to_string(),
            kind: ChannelKind::Stream,
            stations,
        }
    }

    /// URL assigned when the engine starts (not connected until reload/bind).
    pub fn initial_url(&self) -> Option<&str> {
        self.stations.first().map(|s| s.url.as_str())
    }

    /// Look up a station by name (case-insensitive).
    pub fn station(&self, name: &str) -> Option<&Station> {
        self.stations
            .iter()
            .find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn has_picker(&self) -> bool {
        self.stations.len() > 1
    }
}

fn occasional_stations() -> Vec<Station> {
    (1..=6)
        .map(|n| {
            Station::new(
                &format!("RNE OCA {}", n),
                &format!("https://rnelivestream.rtve.es/rneoca/oca{}/master.m3u8", n),
            )
        })
        .collect()
}

fn rne_stations() -> Vec<Station> {
    vec![
        Station::new("R1 CV", R1_CV),
        Station::new(
            "R. Clasica",
            "https://rtvelivestream.rtve.es/rtvesec/rne/rne_r2_main.m3u8",
        ),
        Station::new(
            "Radio 3",
            "https://rtvelivestream.rtve.es/rtvesec/rne/rne_r3_main.m3u8",
        ),
        Station::new(
            "Radio 4 CAT",
            "https://rnelivestream.rtve.es/rner4/main/master.m3u8",
        ),
        Station::new(
            "REE",
            "https://rtvelivestream.rtve.es/rtvesec/rne/rne_re_main.m3u8",
        ),
    ]
}

/// The console's fixed roster: one live input and ten stream channels.
pub fn default_roster() -> Vec<ChannelConfig> {
    vec![
        ChannelConfig::live("LIVE_MIC", "LIVE MIC"),
        ChannelConfig::stream("MIC", "R1 CV (RNE)", vec![Station::new("R1 CV", R1_CV)]),
        ChannelConfig::stream("A", "OCASIONAL (RNE)", occasional_stations()),
        ChannelConfig::stream("RNE_EMISORAS", "RNE EMISORAS", rne_stations()),
        ChannelConfig::stream("ES_RADIO", "ES RADIO", vec![Station::new("esRadio", ES_RADIO)]),
        ChannelConfig::stream(
            "RADIO_MARCA",
            "RADIO MARCA",
            vec![Station::new("Radio Marca", RADIO_MARCA)],
        ),
        ChannelConfig::stream(
            "RADIO_ESPANA",
            "RADIO ESPAÑA",
            vec![Station::new("Radio España", RADIO_ESPANA)],
        ),
        ChannelConfig::stream(
            "C",
            "ONDA CERO ALI",
            vec![Station::new("Onda Cero Alicante", ONDA_CERO_ALI)],
        ),
        ChannelConfig::stream("D", "RADIO 5 ALI", vec![Station::new("Radio 5 Alicante", R5_ALI)]),
        ChannelConfig::stream("E", "COPE ALI", vec![Station::new("COPE Alicante", COPE_ALI)]),
        ChannelConfig::stream("F", "SER ALI", vec![Station::new("SER Alicante", SER_ALI)]),
    ]
}
