use rocket::launch;

#[launch]
fn rocket() -> _ {
    abrp_telemetry_backend::server::build()
}
