use chrono::{Duration, Utc};
use marine_obs::feeds::registry::StationMeta;
use marine_obs::feeds::{StationRegistry, parse_ndbc_latest_obs, parse_osmc_csv};
use marine_obs::model::{PlatformType, Source};
use marine_obs::query::{QueryParams, parse_max_age, parse_types};
use marine_obs::store::{BoundingBox, StationStore};

const OSMC_HEADER: &str = "\
platform_code,platform_type,country,latitude,longitude,time,sst,atmp,slp,windspd,winddir,wvht,waterlevel,clouds,dewpoint
,,,degrees_north,degrees_east,UTC,degree_C,degree_C,hPa,m s-1,degrees_true,m,m,oktas,degree_C
";

fn hours_ago(hours: i64) -> String {
    (Utc::now() - Duration::hours(hours))
        .format(marine_obs::TIME_FORMAT)
        .to_string()
}

fn osmc_csv() -> String {
    format!(
        "{OSMC_HEADER}\
41008, MOORED BUOYS, US, 31.4, -80.87, {t1}, 18.2, 14.8, 1014.7, 5.0, 170.0, NaN, NaN, NaN, 10.1
SHIP,SHIPS,,-30.1,45.2,{t1},22.0,NaN,NaN,NaN,NaN,NaN,NaN,NaN,NaN
SHIP,SHIPS,,-31.0,46.0,{t2},21.0,NaN,NaN,NaN,NaN,NaN,NaN,NaN,NaN
OLD1,DRIFTING BUOYS,FR,60.0,10.0,{old},NaN,NaN,NaN,NaN,NaN,NaN,NaN,NaN,NaN
",
        t1 = hours_ago(1),
        t2 = hours_ago(2),
        old = hours_ago(25),
    )
}

fn ndbc_text() -> String {
    let now = Utc::now() - Duration::minutes(30);
    let stamp = now.format("%Y %m %d %H %M");
    format!(
        "\
#STN       LAT      LON  YYYY MM DD hh mm WDIR WSPD   GST WVHT  DPD APD MWD   PRES  PTDY  ATMP  WTMP  DEWP  VIS   TIDE
#text      deg      deg   yr mo day hr mn degT  m/s   m/s   m   sec sec degT   hPa   hPa  degC  degC  degC  nmi     ft
41008    31.40   -80.87  {stamp} 180   6.0   8.0  1.3   6  4.5 180  1015.2  MM   15.0  18.3  10.2  1.0    2.0
SAQG1    31.25   -81.28  {stamp}  MM    MM    MM   MM  MM   MM  MM  1015.0  MM   15.0    MM  11.0  MM     MM
"
    )
}

fn registry() -> StationRegistry {
    let mut registry = StationRegistry::default();
    registry.insert(
        "SAQG1",
        StationMeta {
            name: "St Simons".to_string(),
            platform_type: PlatformType::Shore,
            owner: "NDBC".to_string(),
        },
    );
    registry
}

#[test]
fn test_osmc_sample_row_end_to_end() {
    let store = StationStore::new();
    store.apply_batch(Source::Osmc, parse_osmc_csv(&osmc_csv()));

    let bbox = BoundingBox {
        lat_min: 30.0,
        lat_max: 35.0,
        lon_min: -85.0,
        lon_max: -75.0,
    };
    let results = store.query(&bbox, 6.0, None);
    assert_eq!(results.len(), 1);

    let public = results[0].to_public();
    assert_eq!(public.id, "41008");
    assert_eq!(public.platform_type, PlatformType::Buoy);
    assert_eq!(public.country.as_deref(), Some("US"));
    assert_eq!(public.sea_temp, Some(18.2));
    assert_eq!(public.air_temp, Some(14.8));
    assert_eq!(public.pressure, Some(1014.7));
    assert_eq!(public.wind_spd, Some(5.0));
    assert_eq!(public.wind_dir, Some(170.0));
    assert_eq!(public.wave_ht, None);

    let json = serde_json::to_value(&public).unwrap();
    assert_eq!(json["type"], "buoy");
    assert!(json.get("wave_ht").is_none());
}

#[test]
fn test_anonymous_ships_both_stored() {
    let store = StationStore::new();
    store.apply_batch(Source::Osmc, parse_osmc_csv(&osmc_csv()));

    let ships = store.query(&BoundingBox::default(), 6.0, parse_types("other").as_ref());
    assert!(ships.is_empty());

    let all = store.query(&BoundingBox::default(), 48.0, None);
    let anon: Vec<_> = all
        .iter()
        .filter(|o| o.platform_code.starts_with("SHIP_"))
        .collect();
    assert_eq!(anon.len(), 2);
    assert_ne!(anon[0].platform_code, anon[1].platform_code);
    assert!(anon.iter().all(|o| o.platform_type == PlatformType::Ship));
}

#[test]
fn test_newer_ndbc_report_replaces_osmc_report() {
    let store = StationStore::new();
    store.apply_batch(Source::Osmc, parse_osmc_csv(&osmc_csv()));
    store.apply_batch(Source::Ndbc, parse_ndbc_latest_obs(&ndbc_text(), &registry()));

    let params = QueryParams {
        lat_min: 30.0,
        lat_max: 35.0,
        lon_min: -85.0,
        lon_max: -75.0,
        ..QueryParams::default()
    };
    let bbox = params.bbox().unwrap();
    let results = store.query(&bbox, params.max_age_hours(), params.type_filter().as_ref());
    assert_eq!(results.len(), 2);

    let buoy = results.iter().find(|o| o.platform_code == "41008").unwrap();
    assert_eq!(buoy.source, Source::Ndbc);
    assert_eq!(buoy.pressure, Some(1015.2));
    assert!((buoy.vis.unwrap() - 1852.0).abs() < 1e-9);
    assert!((buoy.water_level.unwrap() - 0.6096).abs() < 1e-9);
    // Replaced wholesale: OSMC-only fields are gone.
    assert_eq!(buoy.clouds, None);

    let shore = results.iter().find(|o| o.platform_code == "SAQG1").unwrap();
    assert_eq!(shore.platform_type, PlatformType::Shore);
    assert_eq!(shore.wind_dir, None);
    assert_eq!(shore.pressure, Some(1015.0));
}

#[test]
fn test_purge_and_age_filter() {
    let store = StationStore::new();
    store.apply_batch(Source::Osmc, parse_osmc_csv(&osmc_csv()));
    assert_eq!(store.count(), 4);

    assert_eq!(store.query(&BoundingBox::default(), parse_max_age("90m"), None).len(), 2);

    assert_eq!(store.purge(12), 1);
    assert_eq!(store.count(), 3);
    assert!(store.oldest_time().unwrap() > Utc::now() - Duration::hours(12));
}
